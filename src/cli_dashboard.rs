//! Overview (queue counters and live leases per node)
//! Queue (next pending tasks)
//! Failed (tasks that exhausted their attempts)

use std::{
  collections::BTreeMap,
  env,
  error::Error,
  io,
  thread,
  time::{Duration, Instant},
};

use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use dtscan::client::HttpSchedulerClient;
use dtscan::error::ClientError;
use dtscan::models::{QueueStats, ScanTask};
use tokio::runtime::Runtime;
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
  Terminal,
};

const QUEUE_PREVIEW: usize = 20;

#[derive(Clone, Copy)]
enum DashboardTab {
  Overview,
  Queue,
  Failed,
}

struct App {
  current_tab: DashboardTab,
  stats: QueueStats,
  leased: Vec<ScanTask>,
  queued: Vec<ScanTask>,
  failed: Vec<ScanTask>,
  last_error: Option<String>,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Overview,
      stats: QueueStats::default(),
      leased: vec![],
      queued: vec![],
      failed: vec![],
      last_error: None,
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Queue,
      DashboardTab::Queue => DashboardTab::Failed,
      DashboardTab::Failed => DashboardTab::Overview,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Failed,
      DashboardTab::Queue => DashboardTab::Overview,
      DashboardTab::Failed => DashboardTab::Queue,
    }
  }

  /// Leased tasks grouped by the node holding them.
  fn leases_by_node(&self) -> BTreeMap<&str, Vec<&ScanTask>> {
    let mut by_node: BTreeMap<&str, Vec<&ScanTask>> = BTreeMap::new();
    for task in &self.leased {
      let holder = task.lease_holder.as_deref().unwrap_or("?");
      by_node.entry(holder).or_default().push(task);
    }
    by_node
  }
}

async fn fetch_state(client: &HttpSchedulerClient) -> Result<App, ClientError> {
  let mut app = App::new();
  app.stats = client.stats().await?;
  app.leased = client.list_tasks(Some("leased"), None).await?;
  app.queued = client.list_tasks(Some("pending"), Some(QUEUE_PREVIEW)).await?;
  app.failed = client.list_tasks(Some("failed"), None).await?;
  Ok(app)
}

fn main() -> Result<(), Box<dyn Error>> {
  let scheduler_url = env::var("SCHEDULER_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".into());

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let (tx, rx) = std::sync::mpsc::channel::<App>();

  thread::spawn(move || {
    let Ok(rt_bg) = Runtime::new() else {
      return;
    };
    let client = HttpSchedulerClient::new(scheduler_url);
    loop {
      let app_state = rt_bg.block_on(fetch_state(&client)).unwrap_or_else(|e| {
        let mut app = App::new();
        app.last_error = Some(e.to_string());
        app
      });
      if tx.send(app_state).is_err() {
        break;
      }
      thread::sleep(Duration::from_secs(2));
    }
  });

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(new_state) = rx.try_recv() {
      let tab = app.current_tab;
      app = new_state;
      app.current_tab = tab;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Overview", "Queue", "Failed"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("Scan Coordinator"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Overview => 0,
      DashboardTab::Queue => 1,
      DashboardTab::Failed => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Overview => render_overview(f, app, chunks[1]),
    DashboardTab::Queue => render_queue(f, app, chunks[1]),
    DashboardTab::Failed => render_failed(f, app, chunks[1]),
  }

  let footer_text = match &app.last_error {
    Some(e) => format!("Scheduler unreachable: {} | q: Quit", e),
    None => "←/→: Switch Tabs | q: Quit".to_string(),
  };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(if app.last_error.is_some() { Color::Red } else { Color::White }))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn render_overview<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(40), Constraint::Percentage(60)].as_ref())
    .split(area);

  let stats = &app.stats;
  let counters: Vec<ListItem> = [
    ("Pending", stats.pending, Color::Yellow),
    ("Leased", stats.leased, Color::Cyan),
    ("Completed", stats.completed, Color::Green),
    ("Failed", stats.failed, Color::Red),
    ("Live leases", stats.active_leases, Color::White),
  ]
    .iter()
    .map(|(label, count, color)| {
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{:<12}", label), Style::default().fg(*color).add_modifier(Modifier::BOLD)),
        Span::raw(count.to_string()),
      ]))
    })
    .collect();
  let counters_list = List::new(counters)
    .block(Block::default().borders(Borders::ALL).title("Queue"));
  f.render_widget(counters_list, chunks[0]);

  let node_items: Vec<ListItem> = app.leases_by_node().into_iter().map(|(node, tasks)| {
    let mut lines = vec![Spans::from(Span::styled(
      format!("{} ({} task(s))", node, tasks.len()),
      Style::default().add_modifier(Modifier::BOLD),
    ))];
    for task in tasks {
      let expiry = task
        .lease_expiry
        .map(|e| e.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "N/A".into());
      lines.push(Spans::from(Span::raw(format!("  {} until {} (attempt {})", task.target_ip, expiry, task.attempt_count + 1))));
    }
    ListItem::new(lines)
  }).collect();
  let nodes_list = List::new(if node_items.is_empty() { vec![ListItem::new(Spans::from(Span::raw("No active leases")))] } else { node_items })
    .block(Block::default().borders(Borders::ALL).title("Worker Nodes"));
  f.render_widget(nodes_list, chunks[1]);
}

fn render_queue<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let task_items: Vec<ListItem> = app.queued.iter().map(|t| {
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{} ", t.id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
      Span::raw(format!("{} | {} pps | attempts: {}", t.target_ip, t.rate_limit, t.attempt_count)),
    ]))
  }).collect();
  let header = format!("Next {} Pending Tasks (Pending total: {})", QUEUE_PREVIEW, app.stats.pending);
  let tasks_list = List::new(task_items)
    .block(Block::default().borders(Borders::ALL).title(header));
  f.render_widget(tasks_list, area);
}

fn render_failed<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app.failed.iter().map(|t| {
    ListItem::new(Spans::from(vec![
      Span::styled(t.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(), Style::default().fg(Color::Red)),
      Span::raw(" - "),
      Span::raw(format!("{} after {} attempt(s): {}", t.target_ip, t.attempt_count, t.last_error.as_deref().unwrap_or("unknown"))),
    ]))
  }).collect();
  let failed_list = List::new(items)
    .block(Block::default().borders(Borders::ALL).title("Failed Tasks"));
  f.render_widget(failed_list, area);
}

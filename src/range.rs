//! Turns operator-supplied range specs into individual scan targets.
//!
//! Accepted entry forms: a single address (`10.0.0.1`), a CIDR block
//! (`10.0.0.0/30`) and an inclusive dash range (`10.0.0.1-10.0.0.9`).
//! Entries may be separated by commas or whitespace.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use crate::error::QueueError;

pub trait RangeExpander: Send + Sync {
  /// Expands every entry into addresses, or fails without partial output.
  fn expand(&self, ranges: &[String]) -> Result<Vec<IpAddr>, QueueError>;
}

#[derive(Debug, Clone)]
pub struct CidrExpander {
  max_hosts: u128,
}

impl CidrExpander {
  pub fn new(max_hosts: usize) -> Self {
    Self { max_hosts: max_hosts as u128 }
  }
}

impl Default for CidrExpander {
  fn default() -> Self {
    Self::new(65_536)
  }
}

impl RangeExpander for CidrExpander {
  fn expand(&self, ranges: &[String]) -> Result<Vec<IpAddr>, QueueError> {
    let entries: Vec<&str> = ranges
      .iter()
      .flat_map(|r| r.split(|c: char| c == ',' || c.is_whitespace()))
      .filter(|e| !e.is_empty())
      .collect();
    if entries.is_empty() {
      return Err(QueueError::InvalidRange("no targets given".into()));
    }

    let mut budget = self.max_hosts;
    let mut addrs = Vec::new();
    for entry in entries {
      let span = parse_entry(entry)?;
      let count = span.len();
      if count > budget {
        return Err(QueueError::InvalidRange(format!(
          "range expands to more than {} hosts",
          self.max_hosts
        )));
      }
      budget -= count;
      span.push_into(&mut addrs);
    }
    Ok(addrs)
  }
}

enum Span {
  Single(IpAddr),
  Net(IpNet),
  V4(u32, u32),
  V6(u128, u128),
}

impl Span {
  fn len(&self) -> u128 {
    match self {
      Span::Single(_) => 1,
      Span::Net(IpNet::V4(net)) => {
        let size = 1u128 << (32 - net.prefix_len());
        // network and broadcast are dropped below /31
        if net.prefix_len() < 31 { size - 2 } else { size }
      }
      Span::Net(IpNet::V6(net)) => {
        let bits = 128 - u32::from(net.prefix_len());
        if bits == 128 { u128::MAX } else { 1u128 << bits }
      }
      Span::V4(start, end) => u128::from(end - start) + 1,
      Span::V6(start, end) => (end - start).saturating_add(1),
    }
  }

  fn push_into(self, out: &mut Vec<IpAddr>) {
    match self {
      Span::Single(ip) => out.push(ip),
      Span::Net(net) => out.extend(net.hosts()),
      Span::V4(start, end) => out.extend((start..=end).map(|n| IpAddr::V4(Ipv4Addr::from(n)))),
      Span::V6(start, end) => out.extend((start..=end).map(|n| IpAddr::V6(Ipv6Addr::from(n)))),
    }
  }
}

fn parse_entry(entry: &str) -> Result<Span, QueueError> {
  let invalid = || QueueError::InvalidRange(format!("cannot parse '{}'", entry));

  if entry.contains('/') {
    let net: IpNet = entry.parse().map_err(|_| invalid())?;
    return Ok(Span::Net(net.trunc()));
  }

  if let Some((lo, hi)) = entry.split_once('-') {
    let lo: IpAddr = lo.trim().parse().map_err(|_| invalid())?;
    let hi: IpAddr = hi.trim().parse().map_err(|_| invalid())?;
    return match (lo, hi) {
      (IpAddr::V4(lo), IpAddr::V4(hi)) if lo <= hi => Ok(Span::V4(u32::from(lo), u32::from(hi))),
      (IpAddr::V6(lo), IpAddr::V6(hi)) if lo <= hi => Ok(Span::V6(u128::from(lo), u128::from(hi))),
      _ => Err(QueueError::InvalidRange(format!("'{}' is not an ascending range of one address family", entry))),
    };
  }

  entry.parse().map(Span::Single).map_err(|_| invalid())
}

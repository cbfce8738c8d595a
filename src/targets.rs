//! Target expansion.
//!
//! Turns raw ingest lines into a deduplicated, first-seen-ordered address
//! list. A line is one of:
//!
//! - a single IPv4/IPv6 address,
//! - a CIDR block (`10.0.0.0/24`), expanded to host addresses,
//! - an inclusive range (`10.0.0.1-10.0.0.32`),
//! - a hostname, passed through lowercased.
//!
//! Blank lines are dropped and `#` starts a comment, inline or full-line.
//! Any single line expanding past `max_expand` addresses rejects the whole
//! batch before anything is materialized, which keeps an accidental `/8`
//! from flooding the scheduler.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use indexmap::IndexSet;
use ipnetwork::IpNetwork;

use crate::error::ExpandError;

/// Upper bound on what one line may expand to, unless overridden.
pub const DEFAULT_MAX_EXPAND: usize = 65_536;

/// Expands raw lines into a deduplicated address list.
///
/// Order is first-seen. The whole batch fails on the first bad line.
pub fn expand_lines<I, S>(lines: I, max_expand: usize) -> Result<Vec<String>, ExpandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: IndexSet<String> = IndexSet::new();
    for raw in lines {
        let line = strip_comment(raw.as_ref());
        if line.is_empty() {
            continue;
        }
        expand_line(line, max_expand, &mut out)?;
    }
    Ok(out.into_iter().collect())
}

fn strip_comment(raw: &str) -> &str {
    match raw.split_once('#') {
        Some((body, _)) => body.trim(),
        None => raw.trim(),
    }
}

fn expand_line(
    line: &str,
    max_expand: usize,
    out: &mut IndexSet<String>,
) -> Result<(), ExpandError> {
    if line.contains('/') {
        let net: IpNetwork = line
            .parse()
            .map_err(|_| ExpandError::MalformedLine { line: line.into() })?;
        return expand_network(line, net, max_expand, out);
    }

    if let Ok(addr) = line.parse::<IpAddr>() {
        out.insert(addr.to_string());
        return Ok(());
    }

    if let Some((start, end)) = parse_range_endpoints(line) {
        return expand_range(line, start, end, max_expand, out);
    }

    // Anything left is treated as a hostname.
    if !is_plausible_hostname(line) {
        return Err(ExpandError::MalformedLine { line: line.into() });
    }
    out.insert(line.to_ascii_lowercase());
    Ok(())
}

/// `A-B` where both sides parse as addresses. Hostnames containing dashes
/// fall through to hostname handling because their halves do not parse.
fn parse_range_endpoints(line: &str) -> Option<(IpAddr, IpAddr)> {
    let (a, b) = line.split_once('-')?;
    let start = a.trim().parse::<IpAddr>().ok()?;
    let end = b.trim().parse::<IpAddr>().ok()?;
    Some((start, end))
}

fn expand_network(
    line: &str,
    net: IpNetwork,
    max_expand: usize,
    out: &mut IndexSet<String>,
) -> Result<(), ExpandError> {
    // A /0 on either family always blows past any sane limit; bail before
    // asking the network for a size its integer type cannot hold.
    if net.prefix() == 0 {
        return Err(ExpandError::ExpansionTooLarge {
            line: line.into(),
            count: u128::MAX,
            max: max_expand,
        });
    }
    match net {
        IpNetwork::V4(net) => {
            let size = u64::from(net.size());
            // Blocks narrower than /31 scan host addresses only, skipping
            // the network and broadcast addresses.
            let (skip_edges, count) = if net.prefix() < 31 {
                (true, size.saturating_sub(2))
            } else {
                (false, size)
            };
            check_expansion(line, count as u128, max_expand)?;
            let base = u32::from(net.network());
            let start = if skip_edges { base + 1 } else { base };
            for offset in 0..count as u32 {
                out.insert(Ipv4Addr::from(start + offset).to_string());
            }
            Ok(())
        }
        IpNetwork::V6(net) => {
            let count = net.size();
            check_expansion(line, count, max_expand)?;
            let base = u128::from(net.network());
            for offset in 0..count {
                out.insert(Ipv6Addr::from(base + offset).to_string());
            }
            Ok(())
        }
    }
}

fn expand_range(
    line: &str,
    start: IpAddr,
    end: IpAddr,
    max_expand: usize,
    out: &mut IndexSet<String>,
) -> Result<(), ExpandError> {
    match (start, end) {
        (IpAddr::V4(start), IpAddr::V4(end)) => {
            let (lo, hi) = (u32::from(start), u32::from(end));
            if hi < lo {
                return Err(ExpandError::InvalidRange { line: line.into() });
            }
            let count = u128::from(hi - lo) + 1;
            check_expansion(line, count, max_expand)?;
            for value in lo..=hi {
                out.insert(Ipv4Addr::from(value).to_string());
            }
            Ok(())
        }
        (IpAddr::V6(start), IpAddr::V6(end)) => {
            let (lo, hi) = (u128::from(start), u128::from(end));
            if hi < lo {
                return Err(ExpandError::InvalidRange { line: line.into() });
            }
            let count = (hi - lo).saturating_add(1);
            check_expansion(line, count, max_expand)?;
            for value in lo..=hi {
                out.insert(Ipv6Addr::from(value).to_string());
            }
            Ok(())
        }
        // Mixed address families never form a range.
        _ => Err(ExpandError::MalformedLine { line: line.into() }),
    }
}

fn check_expansion(line: &str, count: u128, max_expand: usize) -> Result<(), ExpandError> {
    if count > max_expand as u128 {
        return Err(ExpandError::ExpansionTooLarge {
            line: line.into(),
            count,
            max: max_expand,
        });
    }
    Ok(())
}

fn is_plausible_hostname(line: &str) -> bool {
    !line.is_empty()
        && line
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

//! Address pattern expansion: a single address, a CIDR block, a dash
//! range, or a four-octet pattern with `*` / `a-b` octets. Expansion is
//! capped so a typo cannot queue a four-billion-address scan.

use std::net::Ipv4Addr;

use crate::error::Error;

/// Hard cap on how many addresses one scan may target.
pub const SCAN_LIMIT: usize = 4096;

/// Expands `input` into the candidate address list.
///
/// CIDR blocks exclude the network and broadcast addresses for prefixes
/// shorter than /31; /31 keeps both addresses and /32 yields the single
/// masked address.
///
/// # Errors
///
/// [`Error::InvalidPattern`] for malformed input, inverted ranges, and
/// expansions past [`SCAN_LIMIT`] (the error names both the computed count
/// and the cap).
pub fn expand_pattern(input: &str) -> Result<Vec<Ipv4Addr>, Error> {
    let expr = input.trim();
    if expr.is_empty() {
        return Err(Error::InvalidPattern(
            "please enter an IP address or range".into(),
        ));
    }

    if expr.contains('/') {
        return expand_cidr(expr);
    }

    if let Some((start, end)) = parse_dash_range(expr) {
        return expand_range(start, end);
    }

    if !expr.contains(['*', '-']) {
        return match expr.parse::<Ipv4Addr>() {
            Ok(addr) => Ok(vec![addr]),
            Err(_) => Err(Error::InvalidPattern(format!("invalid IP address: {expr}"))),
        };
    }

    let parts: Vec<&str> = expr.split('.').collect();
    if parts.len() != 4 {
        return Err(Error::InvalidPattern(
            "expected four octets in IP range".into(),
        ));
    }

    let mut octets = Vec::with_capacity(4);
    for (index, part) in parts.iter().enumerate() {
        let values = expand_octet(part)
            .map_err(|e| Error::InvalidPattern(format!("octet {}: {e}", index + 1)))?;
        octets.push(values);
    }

    let total: usize = octets.iter().map(Vec::len).product();
    if total > SCAN_LIMIT {
        return Err(Error::InvalidPattern(format!(
            "range expands to {total} addresses; limit is {SCAN_LIMIT}"
        )));
    }

    let mut ips = Vec::with_capacity(total);
    for &a in &octets[0] {
        for &b in &octets[1] {
            for &c in &octets[2] {
                for &d in &octets[3] {
                    ips.push(Ipv4Addr::new(a, b, c, d));
                }
            }
        }
    }
    Ok(ips)
}

fn expand_octet(part: &str) -> Result<Vec<u8>, String> {
    let trimmed = part.trim();
    if trimmed.is_empty() {
        return Err("empty octet".into());
    }
    if trimmed == "*" {
        return Ok((0..=255).collect());
    }
    if let Some((start, end)) = trimmed.split_once('-') {
        let start = parse_octet_value(start)?;
        let end = parse_octet_value(end)?;
        if start > end {
            return Err(format!("range start greater than end: {trimmed}"));
        }
        return Ok((start..=end).collect());
    }
    Ok(vec![parse_octet_value(trimmed)?])
}

fn parse_octet_value(value: &str) -> Result<u8, String> {
    value
        .trim()
        .parse::<u8>()
        .map_err(|_| format!("invalid octet value: {value}"))
}

fn expand_cidr(expr: &str) -> Result<Vec<Ipv4Addr>, Error> {
    let Some((addr_str, prefix_str)) = expr.split_once('/') else {
        return Err(Error::InvalidPattern(format!("invalid CIDR notation: {expr}")));
    };
    let addr: Ipv4Addr = addr_str
        .trim()
        .parse()
        .map_err(|_| Error::InvalidPattern(format!("invalid CIDR notation: {expr}")))?;
    let prefix: u8 = prefix_str
        .trim()
        .parse()
        .map_err(|_| Error::InvalidPattern(format!("invalid CIDR notation: {expr}")))?;
    if prefix > 32 {
        return Err(Error::InvalidPattern(format!(
            "invalid CIDR prefix length: /{prefix}"
        )));
    }

    let host_bits = 32 - u32::from(prefix);
    let mask = if prefix == 0 { 0 } else { u32::MAX << host_bits };
    let network = u32::from(addr) & mask;

    let (start, end) = match host_bits {
        0 => (network, network),
        1 => (network, network + 1),
        _ => {
            let block = 1u64 << host_bits;
            let last = u64::from(network) + block - 1;
            (network + 1, u32::try_from(last - 1).unwrap_or(u32::MAX))
        }
    };

    let count = u64::from(end) - u64::from(start) + 1;
    if count > SCAN_LIMIT as u64 {
        return Err(Error::InvalidPattern(format!(
            "CIDR expands to {count} addresses; limit is {SCAN_LIMIT}"
        )));
    }

    Ok((start..=end).map(Ipv4Addr::from).collect())
}

fn expand_range(start: Ipv4Addr, end: Ipv4Addr) -> Result<Vec<Ipv4Addr>, Error> {
    let start_val = u32::from(start);
    let end_val = u32::from(end);
    if end_val < start_val {
        return Err(Error::InvalidPattern(
            "end IP must not be lower than start IP".into(),
        ));
    }

    let count = u64::from(end_val) - u64::from(start_val) + 1;
    if count > SCAN_LIMIT as u64 {
        return Err(Error::InvalidPattern(format!(
            "range expands to {count} addresses; limit is {SCAN_LIMIT}"
        )));
    }

    Ok((start_val..=end_val).map(Ipv4Addr::from).collect())
}

fn parse_dash_range(expr: &str) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let (start, end) = expr.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    Some((start, end))
}

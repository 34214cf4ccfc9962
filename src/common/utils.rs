//! Utility functions for stateplane

use crate::common::config::PollPolicy;
use std::collections::HashSet;
use std::future::Future;
use std::net::Ipv4Addr;

/// Host octets below this are reserved by the cloud network (.0 - .3)
const FIRST_HOST_OCTET: u32 = 4;

/// Placeholder IP for DNS records of members that have no owner yet
pub const DEFAULT_HOST_IP: &str = "127.0.0.1";

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a new service UUID
pub fn new_service_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Member name for a replica slot, e.g. `mydb-0`
pub fn member_name(service_name: &str, index: u32) -> String {
    format!("{}-{}", service_name, index)
}

/// Parse the replica index out of a member name such as `mydb-2`
pub fn member_index_from_name(name: &str) -> crate::Result<u32> {
    name.rsplit_once('-')
        .and_then(|(_, idx)| idx.parse::<u32>().ok())
        .ok_or_else(|| crate::Error::InvalidArgument(format!("invalid member name: {}", name)))
}

/// Config file id: `{prefix}-{file_name}-{version}`
pub fn config_file_id(prefix: &str, file_name: &str, version: u64) -> String {
    format!("{}-{}-{}", prefix, file_name, version)
}

/// Version encoded in the last `-` field of a config file id
pub fn config_file_version(file_id: &str) -> crate::Result<u64> {
    file_id
        .rsplit_once('-')
        .and_then(|(_, v)| v.parse::<u64>().ok())
        .ok_or_else(|| {
            crate::Error::InvalidArgument(format!("invalid config file id: {}", file_id))
        })
}

pub fn default_domain_name(cluster: &str) -> String {
    format!("{}-stateplane.com", cluster)
}

/// DNS name of a member: `{member}.{domain}`
pub fn dns_name(member_name: &str, domain: &str) -> String {
    format!("{}.{}", member_name, domain)
}

/// Parse an IPv4 CIDR block (`10.0.1.0/24`) into (network, prefix length)
pub fn parse_cidr(cidr: &str) -> crate::Result<(Ipv4Addr, u32)> {
    let invalid = || crate::Error::InvalidArgument(format!("invalid CIDR: {}", cidr));
    let (addr, len) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let len: u32 = len.parse().map_err(|_| invalid())?;
    if len > 30 {
        return Err(invalid());
    }
    let mask = cidr_mask(len);
    Ok((Ipv4Addr::from(u32::from(addr) & mask), len))
}

fn cidr_mask(len: u32) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - len)
    }
}

/// Next usable IP in `cidr` after `last`, skipping the reserved host octets
/// and anything in `used`.
pub fn next_ip(cidr: &str, last: Option<Ipv4Addr>, used: &HashSet<Ipv4Addr>) -> crate::Result<Ipv4Addr> {
    let (network, len) = parse_cidr(cidr)?;
    let network = u32::from(network);
    let mask = cidr_mask(len);
    let exhausted = || crate::Error::ResourceExhausted(format!("no free IP in {}", cidr));

    // the subnet's own first four addresses and its broadcast are never handed out
    let first = network.checked_add(FIRST_HOST_OCTET).ok_or_else(exhausted)?;
    let broadcast = network | !mask;

    let mut candidate = match last {
        Some(ip) => u32::from(ip).checked_add(1).ok_or_else(exhausted)?.max(first),
        None => first,
    };

    loop {
        let host = candidate & 0xff;
        if host < FIRST_HOST_OCTET {
            candidate = (candidate & !0xff) | FIRST_HOST_OCTET;
        } else if host == 0xff {
            candidate = candidate
                .checked_add(FIRST_HOST_OCTET + 1)
                .ok_or_else(exhausted)?;
            continue;
        }

        if candidate & mask != network || candidate >= broadcast {
            return Err(exhausted());
        }

        let ip = Ipv4Addr::from(candidate);
        if !used.contains(&ip) {
            return Ok(ip);
        }
        candidate = candidate.checked_add(1).ok_or_else(exhausted)?;
    }
}

/// Poll `check` until it reports done, sleeping `policy.interval()` between
/// attempts. Fails with `Timeout` once the attempts or the deadline run out.
pub async fn poll_until<F, Fut>(policy: &PollPolicy, what: &str, mut check: F) -> crate::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<bool>>,
{
    let interval = policy.interval();
    let deadline = tokio::time::Instant::now() + policy.timeout();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if check().await? {
            return Ok(());
        }

        if attempt >= policy.max_attempts || tokio::time::Instant::now() >= deadline {
            return Err(crate::Error::Timeout(format!(
                "{} after {} attempts",
                what, attempt
            )));
        }

        tracing::debug!("Waiting for {} (attempt {})", what, attempt);
        tokio::time::sleep(interval).await;
    }
}

/// Validate a cluster/service name
pub fn validate_name(kind: &str, name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::InvalidArgument(format!("{} cannot be empty", kind)));
    }

    if name.len() > 255 {
        return Err(crate::Error::InvalidArgument(format!(
            "{} too long (max 255 bytes)",
            kind
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::Error::InvalidArgument(format!(
            "{} contains invalid characters: {}",
            kind, name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_member_names() {
        assert_eq!(member_name("mydb", 2), "mydb-2");
        assert_eq!(member_index_from_name("my-db-12").unwrap(), 12);
        assert!(member_index_from_name("mydb").is_err());
        assert!(member_index_from_name("mydb-x").is_err());
    }

    #[test]
    fn test_config_file_id() {
        let id = config_file_id("mydb-0", "member.conf", 3);
        assert_eq!(id, "mydb-0-member.conf-3");
        assert_eq!(config_file_version(&id).unwrap(), 3);
        assert!(config_file_version("member.conf").is_err());
    }

    #[test]
    fn test_parse_cidr() {
        let (net, len) = parse_cidr("10.0.1.17/24").unwrap();
        assert_eq!(net, Ipv4Addr::new(10, 0, 1, 0));
        assert_eq!(len, 24);
        assert!(parse_cidr("10.0.1.0").is_err());
        assert!(parse_cidr("10.0.1.0/31").is_err());
    }

    #[test]
    fn test_next_ip_skips_reserved() {
        let used = HashSet::new();
        let first = next_ip("172.31.64.0/20", None, &used).unwrap();
        assert_eq!(first, Ipv4Addr::new(172, 31, 64, 4));

        let after_last = next_ip("172.31.64.0/20", Some(Ipv4Addr::new(172, 31, 64, 254)), &used).unwrap();
        assert_eq!(after_last, Ipv4Addr::new(172, 31, 65, 4));
    }

    #[test]
    fn test_next_ip_skips_used() {
        let used: HashSet<_> = [Ipv4Addr::new(10, 0, 0, 4), Ipv4Addr::new(10, 0, 0, 5)]
            .into_iter()
            .collect();
        assert_eq!(
            next_ip("10.0.0.0/24", None, &used).unwrap(),
            Ipv4Addr::new(10, 0, 0, 6)
        );
    }

    #[test]
    fn test_next_ip_unaligned_subnet() {
        let used = HashSet::new();
        let first = next_ip("10.0.0.16/28", None, &used).unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 0, 0, 20));

        // a last IP below the subnet still starts past the reserved block
        let below = next_ip("10.0.0.16/28", Some(Ipv4Addr::new(10, 0, 0, 3)), &used).unwrap();
        assert_eq!(below, Ipv4Addr::new(10, 0, 0, 20));

        let last = next_ip("10.0.0.16/28", Some(Ipv4Addr::new(10, 0, 0, 29)), &used).unwrap();
        assert_eq!(last, Ipv4Addr::new(10, 0, 0, 30));
        // .31 is the broadcast address of the /28
        assert!(next_ip("10.0.0.16/28", Some(last), &used).is_err());
    }

    #[test]
    fn test_next_ip_exhausted() {
        let used = HashSet::new();
        let err = next_ip("10.0.0.0/24", Some(Ipv4Addr::new(10, 0, 0, 254)), &used).unwrap_err();
        assert!(matches!(err, crate::Error::ResourceExhausted(_)));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("service", "my-db_1").is_ok());
        assert!(validate_name("service", "").is_err());
        assert!(validate_name("service", "my db").is_err());
    }

    #[tokio::test]
    async fn test_poll_until_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::new(1, 50);
        poll_until(&policy, "counter", || async {
            Ok(calls.fetch_add(1, Ordering::SeqCst) >= 2)
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let policy = PollPolicy::new(1, 3);
        let err = poll_until(&policy, "never", || async { Ok(false) })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Timeout(_)));
    }
}

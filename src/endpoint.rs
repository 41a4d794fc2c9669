use anyhow::anyhow;
use anyhow::Context as _;
use anyhow::Result;
use dns_lookup::lookup_host;
use std::net::IpAddr;
use std::net::SocketAddr;

/// Resolves a host name (or literal address) into an ordered endpoint list.
///
/// Literal IPv4/IPv6 addresses bypass the resolver. The resolver's answer
/// order is preserved; the connect path walks it front to back.
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let ips = lookup_host(host).with_context(|| format!("failed to resolve {host}"))?;
    if ips.is_empty() {
        return Err(anyhow!("no addresses found for {host}"));
    }

    Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
}

/// Resolves a `host:port` string into an ordered endpoint list.
///
/// IPv6 literals use the usual bracket form, e.g. `[::1]:9000`.
pub fn resolve_address(address: &str) -> Result<Vec<SocketAddr>> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(vec![addr]);
    }

    let (host, port) = split_host_port(address)?;
    resolve(host, port)
}

/// Splits `host:port`, tolerating bracketed IPv6 hosts.
pub fn split_host_port(address: &str) -> Result<(&str, u16)> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| anyhow!("unterminated IPv6 literal in {address}"))?;
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing port in {address}"))?;
        (&rest[..end], port)
    } else {
        address
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing port in {address}"))?
    };

    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in {address}"))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_addresses_skip_the_resolver() {
        let endpoints = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(endpoints, vec!["127.0.0.1:8080".parse().unwrap()]);

        let endpoints = resolve("::1", 443).unwrap();
        assert_eq!(endpoints, vec!["[::1]:443".parse().unwrap()]);
    }

    #[test]
    fn host_port_splitting() {
        assert_eq!(split_host_port("example.com:80").unwrap(), ("example.com", 80));
        assert_eq!(split_host_port("[::1]:9000").unwrap(), ("::1", 9000));
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("example.com:notaport").is_err());
    }
}

//! Listener URL parsing: `tcp://host:port`, `unix:///path`, and
//! friends, with query strings carried as an options mapping.

use std::collections::HashMap;

use tokio_listener::{ListenerAddress, SystemOptions, UserOptions};
use url::Url;

use casfs_castore::Error;

#[derive(Debug)]
pub struct ListenConfig {
    pub address: ListenerAddress,
    pub options: HashMap<String, String>,
}

pub fn parse_listen_url(input: &str) -> Result<ListenConfig, Error> {
    let url = Url::parse(input)
        .map_err(|e| Error::Unsupported(format!("invalid listen url {input:?}: {e}")))?;

    let address = match url.scheme() {
        "tcp" | "tcp4" | "tcp6" => {
            let host = url
                .host_str()
                .ok_or_else(|| Error::Unsupported(format!("missing host in {input:?}")))?;
            let port = url
                .port()
                .ok_or_else(|| Error::Unsupported(format!("missing port in {input:?}")))?;
            format!("{host}:{port}")
                .parse::<ListenerAddress>()
                .map_err(|e| Error::Unsupported(format!("invalid address in {input:?}: {e}")))?
        }
        "unix" | "file" => {
            let mut path = String::new();
            if let Some(host) = url.host_str() {
                path.push_str(host);
            }
            path.push_str(url.path());
            if !path.starts_with('/') {
                // relative socket paths need the explicit ./ marker.
                path.insert_str(0, "./");
            }
            path.parse::<ListenerAddress>()
                .map_err(|e| Error::Unsupported(format!("invalid socket path in {input:?}: {e}")))?
        }
        scheme => {
            return Err(Error::Unsupported(format!("invalid scheme: {scheme}")));
        }
    };

    let mut options: HashMap<String, String> = HashMap::new();
    for (key, value) in url.query_pairs() {
        options
            .entry(key.into_owned())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }

    Ok(ListenConfig { address, options })
}

pub async fn bind(config: &ListenConfig) -> Result<tokio_listener::Listener, Error> {
    tokio_listener::Listener::bind(
        &config.address,
        &SystemOptions::default(),
        &UserOptions::default(),
    )
    .await
    .map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_url_parses() {
        let config = parse_listen_url("tcp://127.0.0.1:8080").unwrap();
        assert_eq!(config.address.to_string(), "127.0.0.1:8080");
        assert!(config.options.is_empty());
    }

    #[test]
    fn unix_url_joins_host_and_path() {
        let config = parse_listen_url("unix://run/casfs.sock").unwrap();
        assert!(config.address.to_string().contains("run/casfs.sock"));
    }

    #[test]
    fn unix_url_with_absolute_path() {
        let config = parse_listen_url("unix:///run/casfs.sock").unwrap();
        assert!(config.address.to_string().contains("/run/casfs.sock"));
    }

    #[test]
    fn query_string_becomes_options() {
        let config = parse_listen_url("tcp://127.0.0.1:8080?mode=fast&tag=a&tag=b").unwrap();
        assert_eq!(config.options["mode"], "fast");
        assert_eq!(config.options["tag"], "a,b");
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(parse_listen_url("udp://127.0.0.1:53").is_err());
    }

    #[test]
    fn missing_port_is_rejected() {
        assert!(parse_listen_url("tcp://127.0.0.1").is_err());
    }
}

use std::str::FromStr;
use anyhow::{anyhow, bail};

/// A listen address with the endpoints that accepted connections are forwarded to, written as
///  `[listen-host:]listen-port:host:port[:host:port...]` on the command line. The listen host
///  defaults to `0.0.0.0`.
///
/// NB: IPv6 literals are not supported because of the ':' separator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub listen: String,
    pub connect: Vec<String>,
}

impl FromStr for ListenSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words: Vec<&str> = s.split(':').collect();
        if words.len() % 2 == 1 {
            words.insert(0, "0.0.0.0");
        }
        if words.len() < 4 {
            bail!("{:?} should be [listen-host:]listen-port:host:port[:host:port...]", s);
        }

        let endpoints = words.chunks(2)
            .map(|pair| endpoint(pair[0], pair[1]))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut endpoints = endpoints.into_iter();
        let listen = endpoints.next()
            .ok_or_else(|| anyhow!("{:?} has no listen address", s))?;

        Ok(ListenSpec {
            listen,
            connect: endpoints.collect(),
        })
    }
}

fn endpoint(host: &str, port: &str) -> anyhow::Result<String> {
    if host.is_empty() {
        bail!("empty host name");
    }
    let port: u16 = port.parse()
        .map_err(|_| anyhow!("invalid port {:?}", port))?;
    Ok(format!("{}:{}", host, port))
}

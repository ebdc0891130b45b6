use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};


/// An address string of the form `<transport>://<host>:<port>[,<option>[=<value>]]*`, split
///  into its parts. IPv6 hosts are written in brackets: `udp://[::1]:6060,bnd`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ParsedAddress {
    pub transport: String,
    pub host: String,
    pub port: String,
    pub options: Vec<AddressOption>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AddressOption {
    pub name: String,
    pub value: Option<String>,
}

impl ParsedAddress {
    pub fn parse(s: &str) -> anyhow::Result<ParsedAddress> {
        let mut parts = s.split(',');
        let location = parts.next().unwrap_or_default().trim();

        let (transport, host_and_port) = location.split_once("://")
            .ok_or_else(|| anyhow!("address {:?} has no transport", s))?;
        if transport.is_empty() {
            bail!("address {:?} has an empty transport", s);
        }

        let (host, port) = host_and_port.rsplit_once(':')
            .ok_or_else(|| anyhow!("address {:?} has no port", s))?;
        let host = match host.strip_prefix('[') {
            Some(v6) => v6.strip_suffix(']')
                .ok_or_else(|| anyhow!("unbalanced brackets in address {:?}", s))?,
            None => host,
        };
        if host.is_empty() {
            bail!("address {:?} has an empty host", s);
        }
        port.parse::<u16>()
            .map_err(|_| anyhow!("invalid port {:?} in address {:?}", port, s))?;

        let options = parts
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(|o| match o.split_once('=') {
                Some((name, value)) => AddressOption { name: name.to_string(), value: Some(value.to_string()) },
                None => AddressOption { name: o.to_string(), value: None },
            })
            .collect();

        Ok(ParsedAddress {
            transport: transport.to_ascii_lowercase(),
            host: host.to_string(),
            port: port.to_string(),
            options,
        })
    }

    pub fn option(&self, name: &str) -> Option<&AddressOption> {
        self.options.iter().find(|o| o.name == name)
    }

    /// a flag option is set if it is present without value, or with a value other than `0`
    pub fn flag(&self, name: &str) -> bool {
        match self.option(name) {
            None => false,
            Some(AddressOption { value: None, .. }) => true,
            Some(AddressOption { value: Some(v), .. }) => v != "0",
        }
    }

    pub fn numeric_option<T: FromStr>(&self, name: &str) -> anyhow::Result<Option<T>> {
        match self.option(name) {
            None => Ok(None),
            Some(AddressOption { value: None, .. }) => bail!("option {} requires a value", name),
            Some(AddressOption { value: Some(v), .. }) => v.parse()
                .map(Some)
                .map_err(|_| anyhow!("invalid value {:?} for option {}", v, name)),
        }
    }
}

impl FromStr for ParsedAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParsedAddress::parse(s)
    }
}

impl Display for ParsedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.transport, self.host, self.port)?;
        }
        else {
            write!(f, "{}://{}:{}", self.transport, self.host, self.port)?;
        }
        for option in &self.options {
            match &option.value {
                Some(value) => write!(f, ",{}={}", option.name, value)?,
                None => write!(f, ",{}", option.name)?,
            }
        }
        Ok(())
    }
}

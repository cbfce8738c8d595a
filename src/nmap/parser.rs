//! Scanner XML to structured host records.
//!
//! The parser is total: any byte input, including empty, truncated or
//! hostile, produces a [`HostRecord`]. Error conditions never propagate as
//! `Err`; they land in the record's `error` field so exports and API
//! read-throughs can decide what to do with them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Host liveness as reported by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Up,
    Down,
    Unknown,
}

/// `state` plus the scanner's stated reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStatus {
    pub state: HostState,
    pub reason: String,
}

/// One `<hostname>` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hostname {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// One script result attached to a port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub output: String,
}

/// One scanned port with its service details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRecord {
    pub protocol: String,
    pub port_id: u16,
    pub state: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extrainfo: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scripts: Vec<Script>,
}

/// Why a record carries no usable host data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum RecordError {
    ParseError { details: String },
    NoHost,
}

/// Parsed form of one scan artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub status: HostStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<Hostname>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub addresses: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortRecord>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordError>,
}

impl HostRecord {
    /// No output from the scanner: the host never answered.
    pub fn down() -> Self {
        Self {
            status: HostStatus {
                state: HostState::Down,
                reason: "no-response".to_string(),
            },
            hostnames: Vec::new(),
            addresses: BTreeMap::new(),
            ports: Vec::new(),
            error: None,
        }
    }

    fn errored(error: RecordError) -> Self {
        Self {
            status: HostStatus {
                state: HostState::Unknown,
                reason: String::new(),
            },
            hostnames: Vec::new(),
            addresses: BTreeMap::new(),
            ports: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Parses one artifact's bytes. Never fails; see the module docs.
pub fn parse_host_xml(bytes: &[u8]) -> HostRecord {
    let text = String::from_utf8_lossy(bytes);
    if text.trim().is_empty() {
        return HostRecord::down();
    }

    let doc = match roxmltree::Document::parse(&text) {
        Ok(doc) => doc,
        Err(err) => {
            return HostRecord::errored(RecordError::ParseError {
                details: err.to_string(),
            });
        }
    };
    let root = doc.root_element();

    let Some(host) = root.children().find(|n| n.has_tag_name("host")) else {
        // A run that finished with nothing up is a plain "down", not an
        // error; the runstats summary is the tell.
        let summary = root
            .children()
            .find(|n| n.has_tag_name("runstats"))
            .and_then(|rs| rs.children().find(|n| n.has_tag_name("finished")))
            .and_then(|finished| finished.attribute("summary"));
        if summary.is_some_and(|s| s.contains("0 hosts up")) {
            return HostRecord::down();
        }
        return HostRecord::errored(RecordError::NoHost);
    };

    let status = host
        .children()
        .find(|n| n.has_tag_name("status"))
        .map(|status| HostStatus {
            state: match status.attribute("state") {
                Some("up") => HostState::Up,
                Some("down") => HostState::Down,
                _ => HostState::Unknown,
            },
            reason: status.attribute("reason").unwrap_or("N/A").to_string(),
        })
        .unwrap_or(HostStatus {
            state: HostState::Unknown,
            reason: "N/A".to_string(),
        });

    let mut addresses = BTreeMap::new();
    for addr in host.children().filter(|n| n.has_tag_name("address")) {
        if let (Some(kind), Some(value)) = (addr.attribute("addrtype"), addr.attribute("addr")) {
            addresses.insert(kind.to_string(), value.to_string());
        }
    }

    let hostnames = host
        .children()
        .find(|n| n.has_tag_name("hostnames"))
        .map(|names| {
            names
                .children()
                .filter(|n| n.has_tag_name("hostname"))
                .map(|hn| Hostname {
                    name: hn.attribute("name").unwrap_or_default().to_string(),
                    kind: hn.attribute("type").unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    let ports = host
        .children()
        .find(|n| n.has_tag_name("ports"))
        .map(|ports| {
            ports
                .children()
                .filter(|n| n.has_tag_name("port"))
                .filter_map(parse_port)
                .collect()
        })
        .unwrap_or_default();

    HostRecord {
        status,
        hostnames,
        addresses,
        ports,
        error: None,
    }
}

fn parse_port(port: roxmltree::Node<'_, '_>) -> Option<PortRecord> {
    let protocol = port.attribute("protocol")?.to_string();
    let port_id = port.attribute("portid")?.parse::<u16>().ok()?;

    let state_node = port.children().find(|n| n.has_tag_name("state"));
    let state = state_node
        .and_then(|n| n.attribute("state"))
        .unwrap_or("unknown")
        .to_string();
    let reason = state_node
        .and_then(|n| n.attribute("reason"))
        .unwrap_or_default()
        .to_string();

    let mut record = PortRecord {
        protocol,
        port_id,
        state,
        reason,
        service: None,
        product: None,
        version: None,
        extrainfo: None,
        cpes: Vec::new(),
        scripts: Vec::new(),
    };

    if let Some(service) = port.children().find(|n| n.has_tag_name("service")) {
        record.service = service.attribute("name").map(str::to_string);
        record.product = service.attribute("product").map(str::to_string);
        record.version = service.attribute("version").map(str::to_string);
        record.extrainfo = service.attribute("extrainfo").map(str::to_string);
        record.cpes = service
            .children()
            .filter(|n| n.has_tag_name("cpe"))
            .filter_map(|cpe| cpe.text())
            .map(str::to_string)
            .collect();
    }

    record.scripts = port
        .children()
        .filter(|n| n.has_tag_name("script"))
        .map(|script| Script {
            id: script.attribute("id").unwrap_or_default().to_string(),
            output: script.attribute("output").unwrap_or_default().to_string(),
        })
        .collect();

    Some(record)
}

// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! ICE candidate attribute parsing (RFC 8839 §5.1).
//!
//! ```text
//! candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type>
//!           [raddr <addr>] [rport <port>] [tcptype <tcp-type>] *(<ext-name> <ext-value>)
//! ```

use crate::error::{Result, WhipError};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateTransport {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpType {
    Active,
    Passive,
    SimultaneousOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u16,
    pub transport: CandidateTransport,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    pub tcp_type: Option<TcpType>,
    pub generation: Option<u32>,
    pub ufrag: Option<String>,
    pub network_id: Option<u32>,
    pub network_cost: Option<u32>,
}

fn malformed(value: &str, reason: &str) -> WhipError {
    WhipError::MalformedSdp(format!("{} in candidate '{}'", reason, value))
}

fn number<T: FromStr>(raw: &str, field: &str, value: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| malformed(value, &format!("invalid {} '{}'", field, raw)))
}

impl IceCandidate {
    /// Parses `candidate:...`, with or without a leading `a=`.
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let trimmed = trimmed.strip_prefix("a=").unwrap_or(trimmed);
        let body = trimmed
            .strip_prefix("candidate:")
            .ok_or_else(|| malformed(value, "missing 'candidate:' prefix"))?;

        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(malformed(value, "too few fields"));
        }
        if fields[6] != "typ" {
            return Err(malformed(value, "missing 'typ'"));
        }

        let transport = match fields[2].to_ascii_lowercase().as_str() {
            "udp" => CandidateTransport::Udp,
            "tcp" => CandidateTransport::Tcp,
            other => return Err(malformed(value, &format!("unknown transport '{}'", other))),
        };

        let candidate_type = match fields[7] {
            "host" => CandidateType::Host,
            "srflx" => CandidateType::ServerReflexive,
            "prflx" => CandidateType::PeerReflexive,
            "relay" => CandidateType::Relay,
            other => return Err(malformed(value, &format!("unknown type '{}'", other))),
        };

        let mut candidate = Self {
            foundation: fields[0].to_owned(),
            component: number(fields[1], "component", value)?,
            transport,
            priority: number(fields[3], "priority", value)?,
            address: fields[4].to_owned(),
            port: number(fields[5], "port", value)?,
            candidate_type,
            related_address: None,
            related_port: None,
            tcp_type: None,
            generation: None,
            ufrag: None,
            network_id: None,
            network_cost: None,
        };

        // Remaining fields come in name/value pairs; unknown extensions are skipped.
        for pair in fields[8..].chunks(2) {
            let [name, raw] = pair else {
                return Err(malformed(value, &format!("dangling attribute '{}'", pair[0])));
            };
            match *name {
                "raddr" => candidate.related_address = Some((*raw).to_owned()),
                "rport" => candidate.related_port = Some(number(raw, "rport", value)?),
                "tcptype" => {
                    candidate.tcp_type = Some(match *raw {
                        "active" => TcpType::Active,
                        "passive" => TcpType::Passive,
                        "so" => TcpType::SimultaneousOpen,
                        other => {
                            return Err(malformed(value, &format!("unknown tcptype '{}'", other)));
                        }
                    })
                }
                "generation" => candidate.generation = Some(number(raw, "generation", value)?),
                "ufrag" => candidate.ufrag = Some((*raw).to_owned()),
                "network-id" => candidate.network_id = Some(number(raw, "network-id", value)?),
                "network-cost" => {
                    candidate.network_cost = Some(number(raw, "network-cost", value)?)
                }
                _ => {}
            }
        }

        Ok(candidate)
    }
}

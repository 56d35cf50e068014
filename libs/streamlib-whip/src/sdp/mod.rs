// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// SDP / ICE fragment transforms
//
// Pure text transforms used by the WHIP session:
// - splice gathered candidates into the offer body (no-trickle POST)
// - build `application/trickle-ice-sdpfrag` bodies (RFC 8840) for PATCH
// - recover ICE credentials from the offer when the engine can't supply them
//
// SDP is handled as an ordered list of media sections rather than by string
// substitution, so every section is transformed independently.

pub mod candidate;

pub use candidate::{CandidateTransport, CandidateType, IceCandidate, TcpType};

use crate::error::{Result, WhipError};
use crate::transport::{IceCredentials, LocalCandidate, MediaKind};
use std::fmt;

pub const END_OF_CANDIDATES: &str = "a=end-of-candidates";

const MID_PREFIX: &str = "a=mid:";
const CANDIDATE_PREFIX: &str = "a=candidate:";

/// One `m=` section: the media line plus every line up to the next `m=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub media_line: String,
    pub lines: Vec<String>,
}

impl MediaSection {
    pub fn mid(&self) -> Option<&str> {
        self.lines
            .iter()
            .find_map(|line| line.strip_prefix(MID_PREFIX))
            .map(str::trim)
    }

    /// Media type token of the `m=` line (`audio`, `video`, ...).
    pub fn kind(&self) -> Option<&str> {
        self.media_line
            .strip_prefix("m=")
            .and_then(|rest| rest.split_whitespace().next())
    }

    pub fn candidate_lines(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .map(String::as_str)
            .filter(|line| line.starts_with(CANDIDATE_PREFIX))
    }

    pub fn has_end_of_candidates(&self) -> bool {
        self.lines.iter().any(|line| line == END_OF_CANDIDATES)
    }
}

/// Parsed SDP: session-level lines followed by media sections, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDescription {
    pub session_lines: Vec<String>,
    pub media: Vec<MediaSection>,
}

impl SessionDescription {
    pub fn parse(sdp: &str) -> Result<Self> {
        let mut description = Self::default();

        for line in sdp.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            if line.starts_with("m=") {
                description.media.push(MediaSection {
                    media_line: line.to_owned(),
                    lines: Vec::new(),
                });
            } else if let Some(section) = description.media.last_mut() {
                section.lines.push(line.to_owned());
            } else {
                description.session_lines.push(line.to_owned());
            }
        }

        if description.session_lines.is_empty() && description.media.is_empty() {
            return Err(WhipError::MalformedSdp("empty session description".into()));
        }
        Ok(description)
    }

    /// First value of `a=<name>:`, session level first, then media sections.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        let prefix = format!("a={}:", name);
        self.session_lines
            .iter()
            .chain(self.media.iter().flat_map(|section| section.lines.iter()))
            .find_map(|line| line.strip_prefix(prefix.as_str()))
            .map(str::trim)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.session_lines {
            write!(f, "{}\r\n", line)?;
        }
        for section in &self.media {
            write!(f, "{}\r\n", section.media_line)?;
            for line in &section.lines {
                write!(f, "{}\r\n", line)?;
            }
        }
        Ok(())
    }
}

fn validate_candidates(candidates: &[LocalCandidate]) -> Result<()> {
    for candidate in candidates {
        candidate.parsed()?;
    }
    Ok(())
}

/// Inserts every candidate into every media section that carries an `a=mid:`
/// line. When `end_of_candidates` is set the section reads `a=mid:`,
/// `a=end-of-candidates`, then the candidates in arrival order.
///
/// Candidates already present in a section are not inserted again and an
/// existing end-of-candidates marker is kept, so re-splicing the output with
/// the same input returns it unchanged.
pub fn splice_candidates_into_offer(
    offer_sdp: &str,
    candidates: &[LocalCandidate],
    end_of_candidates: bool,
) -> Result<String> {
    validate_candidates(candidates)?;
    let mut description = SessionDescription::parse(offer_sdp)?;

    for section in description.media.iter_mut() {
        let Some(mid_index) = section
            .lines
            .iter()
            .position(|line| line.starts_with(MID_PREFIX))
        else {
            continue;
        };

        let mut insert_at = mid_index + 1;
        if end_of_candidates && !section.has_end_of_candidates() {
            section.lines.insert(insert_at, END_OF_CANDIDATES.to_owned());
        }

        // Skip past a marker and candidates spliced by an earlier call.
        while insert_at < section.lines.len()
            && (section.lines[insert_at] == END_OF_CANDIDATES
                || section.lines[insert_at].starts_with(CANDIDATE_PREFIX))
        {
            insert_at += 1;
        }

        let mut additions: Vec<String> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let line = candidate.attribute_line();
            if !section.lines.contains(&line) && !additions.contains(&line) {
                additions.push(line);
            }
        }

        section.lines.splice(insert_at..insert_at, additions);
    }

    Ok(description.to_string())
}

/// Builds an RFC 8840 trickle fragment.
///
/// Candidates are grouped by mid in first-seen order. Each group gets an
/// `m=` line stamped with the kind returned by `transceiver_lookup`, its
/// `a=mid:` line, the candidates in arrival order and, when
/// `end_of_candidates` is set, a trailing `a=end-of-candidates`. The ICE
/// credentials are emitted once at the top of the fragment.
pub fn build_trickle_fragment<F>(
    ice_username: &str,
    ice_password: &str,
    pending_candidates: &[LocalCandidate],
    transceiver_lookup: F,
    end_of_candidates: bool,
) -> Result<String>
where
    F: Fn(&str) -> Option<MediaKind>,
{
    validate_candidates(pending_candidates)?;

    let mut groups: Vec<(&str, Vec<&LocalCandidate>)> = Vec::new();
    for candidate in pending_candidates {
        match groups.iter_mut().find(|(mid, _)| *mid == candidate.mid) {
            Some((_, members)) => members.push(candidate),
            None => groups.push((candidate.mid.as_str(), vec![candidate])),
        }
    }

    let mut fragment = format!("a=ice-ufrag:{}\r\na=ice-pwd:{}\r\n", ice_username, ice_password);

    if groups.is_empty() && end_of_candidates {
        fragment.push_str(END_OF_CANDIDATES);
        fragment.push_str("\r\n");
    }

    for (mid, members) in groups {
        let kind =
            transceiver_lookup(mid).ok_or_else(|| WhipError::UnresolvedTransceiver(mid.to_owned()))?;
        fragment.push_str(&format!("m={} 9 RTP/AVP 0\r\n", kind));
        fragment.push_str(&format!("{}{}\r\n", MID_PREFIX, mid));
        for candidate in members {
            fragment.push_str(&candidate.attribute_line());
            fragment.push_str("\r\n");
        }
        if end_of_candidates {
            fragment.push_str(END_OF_CANDIDATES);
            fragment.push_str("\r\n");
        }
    }

    Ok(fragment)
}

/// Pulls `a=ice-ufrag` / `a=ice-pwd` out of the offer.
pub fn extract_ice_credentials(offer_sdp: &str) -> Result<IceCredentials> {
    let description = SessionDescription::parse(offer_sdp)?;

    let username_fragment = description
        .attribute("ice-ufrag")
        .ok_or_else(|| WhipError::MalformedSdp("offer has no a=ice-ufrag".into()))?;
    let password = description
        .attribute("ice-pwd")
        .ok_or_else(|| WhipError::MalformedSdp("offer has no a=ice-pwd".into()))?;

    Ok(IceCredentials {
        username_fragment: username_fragment.to_owned(),
        password: password.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        a=group:BUNDLE 0 1\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=ice-ufrag:EsAw\r\n\
        a=ice-pwd:bP+XJMM09aR8AiX1jdukzR6Y\r\n\
        a=mid:0\r\n\
        a=sendonly\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=ice-ufrag:EsAw\r\n\
        a=ice-pwd:bP+XJMM09aR8AiX1jdukzR6Y\r\n\
        a=mid:1\r\n\
        a=sendonly\r\n\
        a=rtpmap:102 H264/90000\r\n";

    fn candidates() -> Vec<LocalCandidate> {
        vec![
            LocalCandidate::new("candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host", "0"),
            LocalCandidate::new(
                "candidate:2 1 udp 1686052607 203.0.113.7 50001 typ srflx raddr 192.168.1.10 rport 50000",
                "0",
            ),
            LocalCandidate::new("candidate:3 1 tcp 1518280447 192.168.1.10 9 typ host tcptype active", "1"),
        ]
    }

    fn lookup(mid: &str) -> Option<MediaKind> {
        match mid {
            "0" => Some(MediaKind::Audio),
            "1" => Some(MediaKind::Video),
            _ => None,
        }
    }

    #[test]
    fn test_parse_sections() {
        let description = SessionDescription::parse(OFFER).unwrap();
        assert_eq!(description.session_lines.len(), 5);
        assert_eq!(description.media.len(), 2);
        assert_eq!(description.media[0].mid(), Some("0"));
        assert_eq!(description.media[0].kind(), Some("audio"));
        assert_eq!(description.media[1].mid(), Some("1"));
        assert_eq!(description.media[1].kind(), Some("video"));
        assert_eq!(description.to_string(), OFFER);
    }

    #[test]
    fn test_parse_empty_is_malformed() {
        assert!(matches!(
            SessionDescription::parse("\r\n"),
            Err(WhipError::MalformedSdp(_))
        ));
    }

    #[test]
    fn test_splice_every_section_gets_every_candidate() {
        let spliced = splice_candidates_into_offer(OFFER, &candidates(), true).unwrap();
        let description = SessionDescription::parse(&spliced).unwrap();

        for section in &description.media {
            let mid_index = section.lines.iter().position(|l| l.starts_with("a=mid:")).unwrap();
            assert_eq!(section.candidate_lines().count(), 3);
            assert_eq!(
                section.lines.iter().filter(|l| *l == END_OF_CANDIDATES).count(),
                1
            );
            // Marker first, then the candidates in arrival order.
            assert_eq!(section.lines[mid_index + 1], END_OF_CANDIDATES);
            assert_eq!(section.lines[mid_index + 2], candidates()[0].attribute_line());
            assert_eq!(section.lines[mid_index + 3], candidates()[1].attribute_line());
            assert_eq!(section.lines[mid_index + 4], candidates()[2].attribute_line());
            assert_eq!(section.lines[mid_index + 5], "a=sendonly");
        }
        assert!(spliced.ends_with("\r\n"));
    }

    #[test]
    fn test_splice_without_end_of_candidates() {
        let spliced = splice_candidates_into_offer(OFFER, &candidates()[..1], false).unwrap();
        assert!(!spliced.contains(END_OF_CANDIDATES));
        assert_eq!(spliced.matches("a=candidate:").count(), 2);
    }

    #[test]
    fn test_splice_is_idempotent() {
        let once = splice_candidates_into_offer(OFFER, &candidates(), true).unwrap();
        let twice = splice_candidates_into_offer(&once, &candidates(), true).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_splice_sections_are_independent() {
        let offer = format!(
            "{}m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:2\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=inactive\r\n",
            OFFER
        );
        let spliced = splice_candidates_into_offer(&offer, &candidates()[..2], true).unwrap();
        let description = SessionDescription::parse(&spliced).unwrap();

        assert_eq!(description.media.len(), 4);
        for section in &description.media[..3] {
            assert_eq!(section.candidate_lines().count(), 2);
            assert!(section.has_end_of_candidates());
        }
        // No mid line: left alone.
        assert_eq!(description.media[3].lines, vec!["a=inactive".to_owned()]);
    }

    #[test]
    fn test_splice_accepts_lf_line_endings() {
        let lf = OFFER.replace("\r\n", "\n");
        let spliced = splice_candidates_into_offer(&lf, &candidates(), true).unwrap();
        assert!(spliced.contains("a=mid:0\r\na=end-of-candidates\r\na=candidate:1 1 udp"));
    }

    #[test]
    fn test_splice_rejects_invalid_candidate() {
        let bad = vec![LocalCandidate::new("candidate:garbage", "0")];
        assert!(matches!(
            splice_candidates_into_offer(OFFER, &bad, false),
            Err(WhipError::MalformedSdp(_))
        ));
    }

    #[test]
    fn test_fragment_groups_by_mid_in_first_seen_order() {
        let pending = vec![
            LocalCandidate::new("candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host", "0"),
            LocalCandidate::new("candidate:2 1 udp 2122260223 192.168.1.10 50002 typ host", "1"),
            LocalCandidate::new("candidate:3 1 udp 1686052607 203.0.113.7 50001 typ srflx", "0"),
            LocalCandidate::new("candidate:4 1 udp 1686052607 203.0.113.7 50003 typ srflx", "1"),
        ];

        let fragment = build_trickle_fragment("EsAw", "secret", &pending, lookup, false).unwrap();

        let expected = "a=ice-ufrag:EsAw\r\n\
            a=ice-pwd:secret\r\n\
            m=audio 9 RTP/AVP 0\r\n\
            a=mid:0\r\n\
            a=candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host\r\n\
            a=candidate:3 1 udp 1686052607 203.0.113.7 50001 typ srflx\r\n\
            m=video 9 RTP/AVP 0\r\n\
            a=mid:1\r\n\
            a=candidate:2 1 udp 2122260223 192.168.1.10 50002 typ host\r\n\
            a=candidate:4 1 udp 1686052607 203.0.113.7 50003 typ srflx\r\n";
        assert_eq!(fragment, expected);
        assert_eq!(fragment.matches("a=ice-ufrag:").count(), 1);
    }

    #[test]
    fn test_fragment_end_of_candidates_per_group() {
        let fragment = build_trickle_fragment("u", "p", &candidates(), lookup, true).unwrap();
        assert_eq!(fragment.matches(END_OF_CANDIDATES).count(), 2);
        assert!(fragment.contains("typ host tcptype active\r\na=end-of-candidates\r\n"));
    }

    #[test]
    fn test_fragment_end_of_candidates_only() {
        let fragment = build_trickle_fragment("u", "p", &[], lookup, true).unwrap();
        assert_eq!(fragment, "a=ice-ufrag:u\r\na=ice-pwd:p\r\na=end-of-candidates\r\n");
    }

    #[test]
    fn test_fragment_unresolved_transceiver() {
        let pending = vec![LocalCandidate::new(
            "candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host",
            "7",
        )];
        let err = build_trickle_fragment("u", "p", &pending, lookup, false).unwrap_err();
        assert!(matches!(err, WhipError::UnresolvedTransceiver(ref mid) if mid == "7"));
    }

    #[test]
    fn test_extract_credentials() {
        let credentials = extract_ice_credentials(OFFER).unwrap();
        assert_eq!(credentials.username_fragment, "EsAw");
        assert_eq!(credentials.password, "bP+XJMM09aR8AiX1jdukzR6Y");
    }

    #[test]
    fn test_extract_credentials_missing_password() {
        let offer = OFFER.replace("a=ice-pwd:bP+XJMM09aR8AiX1jdukzR6Y\r\n", "");
        let err = extract_ice_credentials(&offer).unwrap_err();
        assert!(matches!(err, WhipError::MalformedSdp(_)));
        assert!(err.to_string().contains("ice-pwd"));
    }
}

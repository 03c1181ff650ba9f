//! Parser for `vless://` server descriptors.
//!
//! Accepted shape: `vless://{user}@{host}:{port}[anything][?{query}][#{remark}]`.
//! Only the anchor up to the port is mandatory; every other irregularity falls
//! back to a default instead of failing the parse.

use std::collections::HashMap;

use chrono::Utc;
use percent_encoding::percent_decode_str;
use uuid::Uuid;

use crate::{
    error::ParseError,
    server::{
        DEFAULT_FLAG, DEFAULT_TRANSPORT, PROTOCOL_VLESS, Security, SecurityParams, ServerConfig,
        default_encryption, default_fingerprint, default_path,
    },
};

pub const SCHEME: &str = "vless://";

struct Anchor<'a> {
    user_id: &'a str,
    address: &'a str,
    port: u16,
    length: usize,
}

pub fn parse(raw: &str) -> Result<ServerConfig, ParseError> {
    let clean: String = raw.trim().chars().filter(|c| *c != '\r' && *c != '\n').collect();

    let anchor = match_anchor(&clean).ok_or_else(|| {
        log::debug!("[uri] anchor mismatch for input of {} bytes", clean.len());
        ParseError::MalformedUri
    })?;

    let (query, remark) = split_tail(&clean, anchor.length);
    let params = parse_query(query);

    let mut security = match (params.get("security"), params.get("tls")) {
        (Some(value), _) => Security::from(value.as_str()),
        (None, Some(_)) => Security::Tls,
        (None, None) => Security::None,
    };

    let mut security_params = SecurityParams {
        sni: params
            .get("sni")
            .or_else(|| params.get("host"))
            .cloned()
            .unwrap_or_default(),
        fingerprint: params.get("fp").cloned().unwrap_or_else(default_fingerprint),
        path: params.get("path").cloned().unwrap_or_else(default_path),
        peer: params.get("peer").cloned().unwrap_or_default(),
        flow: params.get("flow").cloned().unwrap_or_default(),
        encryption: params
            .get("encryption")
            .cloned()
            .unwrap_or_else(default_encryption),
        ..SecurityParams::default()
    };

    let has_public_key = params.contains_key("pbk");
    let reality = security.is_reality()
        || (has_public_key && params.contains_key("sid"))
        || (has_public_key && params.contains_key("tls"));
    if reality {
        security = Security::Reality;
        security_params.public_key = params.get("pbk").cloned().unwrap_or_default();
        security_params.short_id = params.get("sid").cloned().unwrap_or_default();
        security_params.spider_x = params.get("spx").cloned().unwrap_or_else(default_path);
    }

    let remark = remark.map(decode_component).unwrap_or_default();
    let name = if remark.is_empty() {
        format!("Server {}:{}", anchor.address, anchor.port)
    } else {
        remark
    };

    let server = ServerConfig {
        id: Uuid::new_v4().to_string(),
        protocol: PROTOCOL_VLESS.into(),
        name,
        address: anchor.address.to_string(),
        port: anchor.port,
        user_id: anchor.user_id.to_string(),
        transport: params
            .get("type")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TRANSPORT.into()),
        security,
        security_params,
        country_code: String::new(),
        country_name: String::new(),
        flag: DEFAULT_FLAG.into(),
        added_at: Utc::now(),
    };

    log::debug!(
        "[uri] parsed {} ({}, transport={}, security={})",
        server.name,
        server.endpoint(),
        server.transport,
        server.security,
    );
    Ok(server)
}

fn match_anchor(input: &str) -> Option<Anchor<'_>> {
    let rest = input.strip_prefix(SCHEME)?;

    let at = rest.find('@')?;
    let user_id = &rest[..at];
    if user_id.is_empty() {
        return None;
    }

    let after_user = &rest[at + 1..];
    let colon = after_user.find(':')?;
    let address = &after_user[..colon];
    if address.is_empty() {
        return None;
    }

    let after_host = &after_user[colon + 1..];
    let digits = after_host
        .bytes()
        .take_while(|byte| byte.is_ascii_digit())
        .count();
    if digits == 0 {
        return None;
    }
    let port = after_host[..digits]
        .parse::<u16>()
        .ok()
        .filter(|port| *port > 0)?;

    Some(Anchor {
        user_id,
        address,
        port,
        length: SCHEME.len() + at + 1 + colon + 1 + digits,
    })
}

/// Splits whatever follows the anchor into the query and the remark. The
/// remark may follow the query or sit directly after the anchor.
fn split_tail(input: &str, anchor_length: usize) -> (&str, Option<&str>) {
    let tail = &input[anchor_length..];
    match tail.find('?') {
        Some(query_start) => {
            let after_query = &tail[query_start + 1..];
            match after_query.find('#') {
                Some(remark_start) => (
                    &after_query[..remark_start],
                    Some(&after_query[remark_start + 1..]),
                ),
                None => (after_query, None),
            }
        }
        None => ("", tail.find('#').map(|remark_start| &tail[remark_start + 1..])),
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        let Some(equals) = pair.find('=') else {
            continue;
        };
        if equals == 0 {
            continue;
        }
        params.insert(
            pair[..equals].to_string(),
            decode_component(&pair[equals + 1..]),
        );
    }
    params
}

fn decode_component(value: &str) -> String {
    let spaced = value.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

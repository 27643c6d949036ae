// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Adapter URL parsing and URL-driven batch establishment.
//
// URL format:
//   ADDR:SYNC[ARGS]
//   ADDR = connect:UX_SOCKET_PATH |
//          listen:UX_SOCKET_PATH:SHM_PATH
//   SYNC = sync=<true|false>
//   ARGS = :latency=XX | :sync_interval=XX
//
// Values are raw unsigned decimals in the same unit as channel timestamps;
// the parser does no scaling.

use std::sync::Arc;

use crate::channel::{Channel, ChannelParams, SyncMode};
use crate::connect::{establish, Endpoint};
use crate::error::{Error, Result};
use crate::shm::ShmPool;

/// Parameters parsed from one adapter URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterParams {
    pub listen: bool,
    pub socket_path: String,
    /// Only present for `listen:` URLs.
    pub shm_path: Option<String>,
    pub sync: bool,
    pub link_latency: Option<u64>,
    pub sync_interval: Option<u64>,
}

fn parse_uint(s: &str) -> Result<u64> {
    s.parse::<u64>()
        .map_err(|_| Error::Parse(format!("invalid unsigned integer: '{s}'")))
}

/// Parse one adapter URL.
pub fn parse_url(url: &str) -> Result<AdapterParams> {
    let mut fields = url.split(':');

    let listen = match fields.next() {
        Some("listen") => true,
        Some("connect") => false,
        _ => {
            return Err(Error::Parse(format!(
                "type is neither 'listen' nor 'connect': {url}"
            )))
        }
    };

    let socket_path = match fields.next() {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => return Err(Error::Parse(format!("socket path missing: {url}"))),
    };

    let shm_path = if listen {
        match fields.next() {
            Some(p) if !p.is_empty() => Some(p.to_string()),
            _ => return Err(Error::Parse(format!("shared memory path missing: {url}"))),
        }
    } else {
        None
    };

    let sync = match fields.next() {
        Some("sync=true") => true,
        Some("sync=false") => false,
        _ => {
            return Err(Error::Parse(format!(
                "sync parameter missing or malformed: {url}"
            )))
        }
    };

    let mut params = AdapterParams {
        listen,
        socket_path,
        shm_path,
        sync,
        link_latency: None,
        sync_interval: None,
    };

    for opt in fields {
        let (key, value) = opt
            .split_once('=')
            .ok_or_else(|| Error::Parse(format!("optional parameter malformed: {url}")))?;
        if value.is_empty() {
            return Err(Error::Parse(format!("optional parameter malformed: {url}")));
        }
        match key {
            "latency" => params.link_latency = Some(parse_uint(value)?),
            "sync_interval" => params.sync_interval = Some(parse_uint(value)?),
            _ => {
                return Err(Error::Parse(format!(
                    "invalid optional parameter '{key}': {url}"
                )))
            }
        }
    }

    Ok(params)
}

/// Apply parsed URL parameters on top of per-interface defaults.
fn apply(base: &ChannelParams, ap: &AdapterParams) -> ChannelParams {
    let mut params = base.clone();
    params.sock_path = ap.socket_path.clone();
    if ap.sync {
        params.sync_mode = SyncMode::Required;
        if let Some(lat) = ap.link_latency {
            params.link_latency = lat;
        }
        if let Some(si) = ap.sync_interval {
            params.sync_interval = si;
        }
    } else {
        params.sync_mode = SyncMode::Disabled;
    }
    params
}

/// One interface to establish from a URL: base channel parameters plus the
/// upper-layer intro to send and the expected length of the peer's.
pub struct UrlInterface {
    pub base: ChannelParams,
    pub tx_intro: Vec<u8>,
    pub peer_intro_len: usize,
}

/// An established interface: the channel and the peer's upper-layer intro.
pub struct Established {
    pub channel: Channel,
    pub peer_intro: Vec<u8>,
}

/// Parse `urls`, create one pool at `pool_path` sized for all listener sides,
/// set up every endpoint, and drive the joint handshake.
///
/// Returns the established channels in input order. Any failure (parse,
/// socket, pool, intro) aborts the whole batch.
pub fn establish_with_urls(
    urls: &[&str],
    interfaces: Vec<UrlInterface>,
    pool_path: &str,
) -> Result<Vec<Established>> {
    assert_eq!(urls.len(), interfaces.len());

    let mut parsed = Vec::with_capacity(urls.len());
    for (i, url) in urls.iter().enumerate() {
        parsed.push(
            parse_url(url).map_err(|e| Error::Parse(format!("url {i} ('{url}'): {e}")))?,
        );
    }

    // One pool covers every listener side.
    let mut pool_size = 0;
    let mut endpoints = Vec::with_capacity(urls.len());
    for (ap, intf) in parsed.iter().zip(interfaces.iter()) {
        let params = apply(&intf.base, ap);
        if ap.listen {
            pool_size += params.shm_size();
        }
        endpoints.push(Endpoint::new(params, ap.listen)?);
    }

    let pool = if pool_size > 0 {
        Some(Arc::new(ShmPool::create(pool_path, pool_size)?))
    } else {
        None
    };

    for ((ep, ap), intf) in endpoints.iter_mut().zip(parsed.iter()).zip(interfaces) {
        ep.set_intro(intf.tx_intro);
        ep.expect_peer_intro_len(intf.peer_intro_len);
        if ap.listen {
            ep.listen(pool.as_ref().expect("listener urls imply a pool"))?;
        } else {
            ep.connect()?;
        }
    }

    let mut refs: Vec<&mut Endpoint> = endpoints.iter_mut().collect();
    establish(&mut refs)?;

    let mut out = Vec::with_capacity(endpoints.len());
    for ep in endpoints {
        let peer_intro = ep.peer_intro().to_vec();
        out.push(Established {
            channel: ep.into_channel()?,
            peer_intro,
        });
    }
    Ok(out)
}

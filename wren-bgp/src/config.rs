//
// Copyright (c) The Wren Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};
use wren_utils::socket::TTL_MAX;

use crate::packet::consts::AddPathMode;
use crate::session::PeerType;

// BGP instance configuration.
#[derive(Clone, Copy, Debug)]
#[derive(Deserialize, Serialize)]
pub struct InstanceCfg {
    pub asn: u32,
    pub identifier: Ipv4Addr,
}

// BGP neighbor configuration.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct NeighborCfg {
    pub enabled: bool,
    pub peer_as: u32,
    pub damping_enabled: bool,
    pub bfd_enabled: bool,
    pub add_path: Option<AddPathMode>,
    pub timers: NeighborTimersCfg,
    pub transport: NeighborTransportCfg,
}

// BGP neighbor timers configuration.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct NeighborTimersCfg {
    pub connect_retry_interval: u16,
    pub holdtime: u16,
    // When unset, a third of the negotiated hold-time is used.
    pub keepalive: Option<u16>,
}

// BGP neighbor transport configuration.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct NeighborTransportCfg {
    pub local_addr: Option<IpAddr>,
    pub ifname: Option<String>,
    pub tcp_mss: Option<u16>,
    pub ebgp_multihop_enabled: bool,
    pub ebgp_multihop_ttl: Option<u8>,
    pub ttl_security: Option<u8>,
    pub passive_mode: bool,
    pub md5_key: Option<String>,
}

// ===== impl NeighborCfg =====

impl NeighborCfg {
    // Returns the TTL used for outgoing packets.
    pub(crate) fn tx_ttl(&self, peer_type: PeerType) -> u8 {
        match peer_type {
            PeerType::Internal => TTL_MAX,
            PeerType::External => {
                if self.transport.ttl_security.is_some() {
                    // RFC 5082's Generalized TTL Security Mechanism.
                    TTL_MAX
                } else if self.transport.ebgp_multihop_enabled {
                    self.transport.ebgp_multihop_ttl.unwrap_or(TTL_MAX)
                } else {
                    1
                }
            }
        }
    }
}

impl Default for NeighborCfg {
    fn default() -> NeighborCfg {
        NeighborCfg {
            enabled: true,
            peer_as: 0,
            damping_enabled: false,
            bfd_enabled: false,
            add_path: None,
            timers: Default::default(),
            transport: Default::default(),
        }
    }
}

impl Default for NeighborTimersCfg {
    fn default() -> NeighborTimersCfg {
        NeighborTimersCfg {
            connect_retry_interval: 120,
            holdtime: 180,
            keepalive: None,
        }
    }
}

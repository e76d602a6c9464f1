//
// Copyright (c) The Wren Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use derive_new::new;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::Responder;

// Useful type definition(s).
pub type IbusReceiver = UnboundedReceiver<IbusMsg>;
pub type IbusSender = UnboundedSender<IbusMsg>;

/// Nexthop resolution data returned by the routing component.
///
/// Directly attached destinations are reported with the unspecified address
/// as their nexthop.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct NexthopInfo {
    /// Interface the nexthop is reachable through.
    pub ifname: String,
    /// Address of the nexthop.
    pub nexthop: IpAddr,
    /// Address assigned to the egress interface, when known.
    pub local: Option<IpAddr>,
}

/// Ibus message for communication among the different base components.
#[derive(Debug)]
pub enum IbusMsg {
    /// Query whether a route to the given address exists in the RIB.
    ///
    /// The resolution is restricted to the given interface, when present.
    /// The responder receives the resolved nexthop information, or `None`
    /// when the address is unreachable.
    NexthopQuery {
        addr: IpAddr,
        ifname: Option<String>,
        responder: Responder<Option<NexthopInfo>>,
    },
    /// Query whether the given address is assigned to a local interface.
    AddrOwnershipQuery {
        addr: IpAddr,
        responder: Responder<bool>,
    },
}

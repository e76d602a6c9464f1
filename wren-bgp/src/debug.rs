//
// Copyright (c) The Wren Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use tracing::{debug, debug_span};

use crate::fsm;
use crate::packet::consts::AttrType;
use crate::packet::error::AttrError;
use crate::packet::message::Message;
use crate::session::Direction;

// BGP debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    NbrFsmEvent(&'a IpAddr, &'a fsm::Event),
    NbrFsmTransition(&'a IpAddr, Direction, &'a fsm::State, &'a fsm::State),
    NbrMsgRx(&'a IpAddr, &'a Message),
    NbrMsgTx(&'a IpAddr, &'a Message),
    NbrAttrError(AttrType, AttrError),
    NbrCollision(&'a IpAddr, Direction),
    NbrUnexpectedOpen(&'a IpAddr),
    NbrRestartScheduled(&'a IpAddr, u16),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::NbrFsmEvent(addr, event) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("fsm").in_scope(|| {
                        debug!(?event, "{}", self);
                    });
                });
            }
            Debug::NbrFsmTransition(addr, direction, old_state, new_state) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("fsm").in_scope(|| {
                        debug!(
                            ?direction,
                            ?old_state,
                            ?new_state,
                            "{}",
                            self
                        );
                    });
                });
            }
            Debug::NbrMsgRx(addr, msg) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("input").in_scope(|| {
                        let data = serde_json::to_string(&msg).unwrap();
                        debug!(%data, "{}", self);
                    });
                });
            }
            Debug::NbrMsgTx(addr, msg) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("output").in_scope(|| {
                        let data = serde_json::to_string(&msg).unwrap();
                        debug!(%data, "{}", self);
                    });
                });
            }
            Debug::NbrAttrError(attr_type, action) => {
                debug!(?attr_type, ?action, "{}", self);
            }
            Debug::NbrCollision(addr, closed_direction) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!(?closed_direction, "{}", self);
                });
            }
            Debug::NbrUnexpectedOpen(addr) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::NbrRestartScheduled(addr, seconds) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!(%seconds, "{}", self);
                });
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    // Display debug message.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::NbrFsmEvent(..) => {
                write!(f, "neighbor FSM event")
            }
            Debug::NbrFsmTransition(..) => {
                write!(f, "neighbor FSM state transition")
            }
            Debug::NbrMsgRx(..) => {
                write!(f, "received message")
            }
            Debug::NbrMsgTx(..) => {
                write!(f, "sent message")
            }
            Debug::NbrAttrError(..) => {
                write!(f, "malformed attribute")
            }
            Debug::NbrCollision(..) => {
                write!(f, "connection collision resolved")
            }
            Debug::NbrUnexpectedOpen(..) => {
                write!(f, "unexpected OPEN message, ignoring")
            }
            Debug::NbrRestartScheduled(..) => {
                write!(f, "automatic restart scheduled")
            }
        }
    }
}

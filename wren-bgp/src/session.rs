//
// Copyright (c) The Wren Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use wren_utils::Sender;
use wren_utils::UnboundedSender;
use wren_utils::ibus::IbusSender;
use wren_utils::socket::{TcpConnInfo, TcpStream};
use wren_utils::task::{IntervalTask, Task, TimeoutTask};

use crate::config::{InstanceCfg, NeighborCfg};
use crate::debug::Debug;
use crate::fsm;
use crate::packet::consts::{AS_TRANS, Afi, BGP_VERSION, Safi};
use crate::packet::message::{
    AddPathTuple, Capability, DecodeCxt, EncodeCxt, KeepaliveMsg, Message,
    NegotiatedCapability, NotificationMsg, OpenMsg, UpdateMsg,
};
use crate::tasks;
use crate::tasks::messages::input::ManagerMsg;
use crate::tasks::messages::output::NbrTxMsg;

// BGP peer type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PeerType {
    Internal,
    External,
}

// Direction of a connection attempt.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

// Single connection attempt towards a neighbor.
//
// A neighbor can have up to two sessions (one per direction) while a
// connection collision is in progress.
#[derive(Debug)]
pub struct Session {
    pub remote_addr: IpAddr,
    pub direction: Direction,
    pub state: fsm::State,
    pub conn_info: Option<TcpConnInfo>,
    pub identifier: Option<Ipv4Addr>,
    pub holdtime_nego: Option<u16>,
    pub capabilities_adv: BTreeSet<Capability>,
    pub capabilities_rcvd: BTreeSet<Capability>,
    pub capabilities_nego: BTreeSet<NegotiatedCapability>,
    pub notification_sent: Option<(DateTime<Utc>, NotificationMsg)>,
    pub notification_rcvd: Option<(DateTime<Utc>, NotificationMsg)>,
    pub last_established: Option<DateTime<Utc>>,
    pub statistics: SessionStatistics,
    // Incremented whenever the session is closed, so that expiries from
    // timers of a previous connection can be told apart and discarded.
    pub timer_epoch: u64,
    pub tasks: SessionTasks,
    pub msg_txp: Option<UnboundedSender<NbrTxMsg>>,
}

// Session statistics.
#[derive(Debug, Default)]
pub struct SessionStatistics {
    pub established_transitions: u32,
    pub connect_retries: u32,
    pub msgs_rcvd: MessageStatistics,
    pub msgs_sent: MessageStatistics,
}

// Per-message-type counters.
#[derive(Debug, Default)]
pub struct MessageStatistics {
    pub total: Arc<AtomicU32>,
    pub updates: u32,
    pub notifications: u32,
}

// Session tasks.
#[derive(Debug, Default)]
pub struct SessionTasks {
    pub connect: Option<Task<()>>,
    pub connect_retry: Option<TimeoutTask>,
    pub tcp_rx: Option<Task<()>>,
    pub keepalive: Option<IntervalTask>,
    pub holdtime: Option<TimeoutTask>,
}

// Session data that outlives the FSM and is owned by the session manager.
pub(crate) struct SessionCtx<'a> {
    pub config: &'a NeighborCfg,
    pub instance: &'a InstanceCfg,
    pub peer_type: PeerType,
    pub bfd_up: bool,
    pub msg_inp: &'a Sender<ManagerMsg>,
    pub ibus_tx: &'a IbusSender,
}

// Manager-level actions requested while processing an FSM event.
#[derive(Debug)]
pub enum Output {
    CollisionCheck(Ipv4Addr),
    UpdateRcvd(UpdateMsg),
}

// ===== impl Direction =====

impl Direction {
    pub(crate) fn opposite(&self) -> Direction {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        }
    }
}

// ===== impl Session =====

impl Session {
    pub(crate) fn new(remote_addr: IpAddr, direction: Direction) -> Session {
        Session {
            remote_addr,
            direction,
            state: fsm::State::Idle,
            conn_info: None,
            identifier: None,
            holdtime_nego: None,
            capabilities_adv: Default::default(),
            capabilities_rcvd: Default::default(),
            capabilities_nego: Default::default(),
            notification_sent: None,
            notification_rcvd: None,
            last_established: None,
            statistics: Default::default(),
            timer_epoch: 0,
            tasks: Default::default(),
            msg_txp: None,
        }
    }

    // Runs the transition function for the given event and executes the
    // requested side effects.
    pub(crate) fn fsm_event(
        &mut self,
        ctx: &SessionCtx<'_>,
        event: fsm::Event,
    ) -> Vec<Output> {
        Debug::NbrFsmEvent(&self.remote_addr, &event).log();

        let fsm_ctx = self.fsm_context(ctx);
        let (next_state, effects) =
            fsm::transition(self.state, &fsm_ctx, event);

        let mut outputs = Vec::new();
        for effect in effects {
            self.apply_effect(ctx, effect, &mut outputs);
        }

        if let Some(next_state) = next_state
            && self.state != next_state
        {
            self.fsm_state_change(next_state);
        }

        outputs
    }

    fn fsm_context(&self, ctx: &SessionCtx<'_>) -> fsm::Context {
        fsm::Context {
            remote_addr: self.remote_addr,
            local_as: ctx.instance.asn,
            router_id: ctx.instance.identifier,
            peer_as: ctx.config.peer_as,
            peer_type: ctx.peer_type,
            holdtime_cfg: ctx.config.timers.holdtime,
            keepalive_cfg: ctx.config.timers.keepalive,
            passive: self.direction == Direction::Inbound
                || ctx.config.transport.passive_mode,
            bfd_required: ctx.config.bfd_enabled,
            bfd_up: ctx.bfd_up,
        }
    }

    fn apply_effect(
        &mut self,
        ctx: &SessionCtx<'_>,
        effect: fsm::Effect,
        outputs: &mut Vec<Output>,
    ) {
        match effect {
            fsm::Effect::ConnectStart => {
                self.tasks.connect = Some(tasks::tcp_connect(
                    self,
                    ctx.config,
                    ctx.peer_type,
                    ctx.ibus_tx,
                    ctx.msg_inp,
                ));
            }
            fsm::Effect::ConnectRetryStart => {
                self.tasks.connect_retry = Some(tasks::nbr_timer(
                    self,
                    fsm::Timer::ConnectRetry,
                    ctx.config.timers.connect_retry_interval,
                    ctx.msg_inp,
                ));
            }
            fsm::Effect::ConnectRetryStop => {
                self.tasks.connect_retry = None;
            }
            fsm::Effect::HoldTimerStart(seconds) => {
                self.tasks.holdtime = Some(tasks::nbr_timer(
                    self,
                    fsm::Timer::Hold,
                    seconds,
                    ctx.msg_inp,
                ));
            }
            fsm::Effect::HoldTimerRestart => {
                if let Some(holdtime) = self.tasks.holdtime.as_mut() {
                    holdtime.reset(None);
                }
            }
            fsm::Effect::HoldTimerStop => {
                self.tasks.holdtime = None;
            }
            fsm::Effect::KeepaliveStart(seconds) => {
                self.tasks.keepalive =
                    Some(tasks::nbr_kalive_interval(self, seconds));
            }
            fsm::Effect::ConnectionSetup(stream, conn_info) => {
                self.connection_setup(ctx, stream, conn_info);
            }
            fsm::Effect::SessionClose(msg) => {
                self.session_close(msg);
            }
            fsm::Effect::SendOpen => {
                self.open_send(ctx);
            }
            fsm::Effect::SendKeepalive => {
                self.message_send(Message::Keepalive(KeepaliveMsg {}));
            }
            fsm::Effect::StoreOpen(msg, holdtime_nego) => {
                self.store_open(msg, holdtime_nego);
            }
            fsm::Effect::CollisionCheck(identifier) => {
                outputs.push(Output::CollisionCheck(identifier));
            }
            fsm::Effect::DeliverUpdate(msg) => {
                outputs.push(Output::UpdateRcvd(msg));
            }
            fsm::Effect::FlagUnexpectedOpen => {
                Debug::NbrUnexpectedOpen(&self.remote_addr).log();
            }
            fsm::Effect::LogError(error) => {
                error.log();
            }
        }
    }

    fn connection_setup(
        &mut self,
        ctx: &SessionCtx<'_>,
        stream: TcpStream,
        conn_info: TcpConnInfo,
    ) {
        // The connector task, if any, has done its job.
        self.tasks.connect = None;

        // Store TCP connection information.
        self.conn_info = Some(conn_info);

        // Split TCP stream into two halves.
        let (read_half, write_half) = stream.into_split();

        // Spawn neighbor Tx task.
        let (msg_txp, msg_txc) = mpsc::unbounded_channel();
        let cxt = EncodeCxt {
            capabilities: Default::default(),
        };
        let mut tx_task = tasks::nbr_tx(self, cxt, write_half, msg_txc);
        self.msg_txp = Some(msg_txp);

        // Spawn neighbor Rx task. The locally advertised capabilities take
        // part in the Rx-direction negotiation once the peer's OPEN arrives.
        let cxt = DecodeCxt {
            peer_type: ctx.peer_type,
            peer_as: ctx.config.peer_as,
            capabilities: Default::default(),
        };
        let local_caps = Self::capabilities_adv(ctx)
            .iter()
            .map(|cap| cap.as_negotiated())
            .collect();
        let tcp_rx_task =
            tasks::nbr_rx(self, cxt, local_caps, read_half, ctx.msg_inp);
        self.tasks.tcp_rx = Some(tcp_rx_task);

        // The Tx task doesn't need to be stored anywhere. It will exit as
        // soon as the Tx end of its mpsc channel is dropped.
        tx_task.detach();
    }

    // Capabilities advertised in the local OPEN message.
    fn capabilities_adv(ctx: &SessionCtx<'_>) -> BTreeSet<Capability> {
        // Base capabilities, always advertised.
        let mut capabilities: BTreeSet<_> = [
            Capability::MultiProtocol {
                afi: Afi::Ipv4,
                safi: Safi::Unicast,
            },
            Capability::MultiProtocol {
                afi: Afi::Ipv6,
                safi: Safi::Unicast,
            },
            Capability::FourOctetAsNumber {
                asn: ctx.instance.asn,
            },
        ]
        .into();

        // Add-Path capability.
        if let Some(mode) = ctx.config.add_path {
            capabilities.insert(Capability::AddPath(
                [Afi::Ipv4, Afi::Ipv6]
                    .into_iter()
                    .map(|afi| AddPathTuple {
                        afi,
                        safi: Safi::Unicast,
                        mode,
                    })
                    .collect(),
            ));
        }

        capabilities
    }

    fn open_send(&mut self, ctx: &SessionCtx<'_>) {
        let capabilities = Self::capabilities_adv(ctx);

        // Keep track of the advertised capabilities.
        self.capabilities_adv.clone_from(&capabilities);

        // Fill-in and send message.
        let msg = Message::Open(OpenMsg {
            version: BGP_VERSION,
            my_as: ctx.instance.asn.try_into().unwrap_or(AS_TRANS),
            holdtime: ctx.config.timers.holdtime,
            identifier: ctx.instance.identifier,
            capabilities,
        });
        self.message_send(msg);
    }

    fn store_open(&mut self, msg: OpenMsg, holdtime_nego: Option<u16>) {
        self.identifier = Some(msg.identifier);
        self.holdtime_nego = holdtime_nego;
        self.capabilities_rcvd = msg.capabilities;

        // Compute the negotiated capabilities.
        let adv = self
            .capabilities_adv
            .iter()
            .map(|cap| cap.as_negotiated())
            .collect::<BTreeSet<_>>();
        let rcvd = self
            .capabilities_rcvd
            .iter()
            .map(|cap| cap.as_negotiated())
            .collect::<BTreeSet<_>>();
        self.capabilities_nego = adv.intersection(&rcvd).cloned().collect();

        // The negotiated capabilities affect how some messages should be
        // encoded.
        if let Some(msg_txp) = &self.msg_txp {
            let _ = msg_txp.send(NbrTxMsg::UpdateCapabilities(
                self.capabilities_nego.clone(),
            ));
        }
    }

    pub(crate) fn message_send(&mut self, msg: Message) {
        Debug::NbrMsgTx(&self.remote_addr, &msg).log();

        // Update statistics.
        self.statistics.msgs_sent.update(&msg);

        // Keep track of the last sent notification.
        if let Message::Notification(msg) = &msg {
            self.notification_sent = Some((Utc::now(), msg.clone()));
        }

        // Ignore any possible error as the connection might have gone down
        // already.
        if let Some(msg_txp) = &self.msg_txp {
            let _ = msg_txp.send(NbrTxMsg::SendMessage { msg });
        }
    }

    fn session_close(&mut self, send_notif: Option<NotificationMsg>) {
        // Send notification message before closing the session.
        if self.state >= fsm::State::OpenSent
            && let Some(msg) = send_notif
        {
            self.message_send(Message::Notification(msg));
        }

        // Expire timer events queued by the previous connection.
        self.timer_epoch += 1;

        // Update statistics.
        self.statistics.connect_retries += 1;

        // Release all session resources.
        self.conn_info = None;
        self.identifier = None;
        self.holdtime_nego = None;
        self.capabilities_adv.clear();
        self.capabilities_rcvd.clear();
        self.capabilities_nego.clear();
        self.tasks = Default::default();
        self.msg_txp = None;
    }

    fn fsm_state_change(&mut self, next_state: fsm::State) {
        Debug::NbrFsmTransition(
            &self.remote_addr,
            self.direction,
            &self.state,
            &next_state,
        )
        .log();

        // Keep track of the time the session last transitioned in or out of
        // the Established state.
        if self.state == fsm::State::Established
            || next_state == fsm::State::Established
        {
            self.last_established = Some(Utc::now());
        }
        if next_state == fsm::State::Established {
            self.statistics.established_transitions += 1;
        }

        self.state = next_state;
    }
}

// ===== impl MessageStatistics =====

impl MessageStatistics {
    pub(crate) fn update(&mut self, msg: &Message) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match msg {
            Message::Update(_) => {
                self.updates += 1;
            }
            Message::Notification(_) => {
                self.notifications += 1;
            }
            _ => (),
        }
    }
}

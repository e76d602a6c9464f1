//
// Copyright (c) The Wren Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use tokio::sync::mpsc;
use tracing::{Instrument, debug_span};
use wren_utils::ibus::IbusSender;
use wren_utils::task::{Task, TimeoutTask};
use wren_utils::{Receiver, Sender, UnboundedSender};

use crate::config::{InstanceCfg, NeighborCfg};
use crate::debug::Debug;
use crate::events;
use crate::fsm;
use crate::packet::message::UpdateMsg;
use crate::session::{Direction, Output, PeerType, Session, SessionCtx};
use crate::tasks;
use crate::tasks::messages::input::{
    AutoStopReason, BfdStateMsg, CommandMsg, ManagerMsg, SendUpdateMsg,
    TcpAcceptMsg,
};
use crate::tasks::messages::output::PeerMsg;

// Delays applied to damped automatic restarts. Escalates one step per
// failure and saturates at the final entry, where zero means an immediate
// restart.
pub(crate) const IDLE_HOLD_LADDER: [u16; 9] =
    [0, 5, 10, 30, 120, 180, 300, 500, 0];
pub(crate) const IDLE_HOLD_DEFAULT: usize = 1;

// Per-neighbor session manager.
//
// Owns up to two sessions (one per connection direction) and resolves
// collisions between them. All events are delivered through a single
// mailbox, consumed by the manager task alone.
#[derive(Debug)]
pub struct SessionManager {
    pub remote_addr: IpAddr,
    pub config: NeighborCfg,
    pub instance_cfg: InstanceCfg,
    pub peer_type: PeerType,
    pub sessions: BTreeMap<Direction, Session>,
    // Direction of the established session, if any.
    pub active: Option<Direction>,
    pub idle_hold_index: usize,
    pub started: bool,
    pub bfd_up: bool,
    pub restart: Option<TimeoutTask>,
    pub msg_inp: Sender<ManagerMsg>,
    pub ibus_tx: IbusSender,
    pub peer_txp: UnboundedSender<PeerMsg>,
}

// Handle used by the owning peer to drive a session manager.
//
// Dropping the handle aborts the manager task and all its sessions.
#[derive(Debug)]
pub struct ManagerHandle {
    pub msg_txp: Sender<ManagerMsg>,
    _task: Task<()>,
}

// ===== impl SessionManager =====

impl SessionManager {
    pub(crate) fn new(
        remote_addr: IpAddr,
        config: NeighborCfg,
        instance_cfg: InstanceCfg,
        msg_inp: Sender<ManagerMsg>,
        ibus_tx: IbusSender,
        peer_txp: UnboundedSender<PeerMsg>,
    ) -> SessionManager {
        let peer_type = if config.peer_as == instance_cfg.asn {
            PeerType::Internal
        } else {
            PeerType::External
        };
        SessionManager {
            remote_addr,
            config,
            instance_cfg,
            peer_type,
            sessions: Default::default(),
            active: None,
            idle_hold_index: IDLE_HOLD_DEFAULT,
            started: false,
            // Assume the BFD session is up until told otherwise.
            bfd_up: true,
            restart: None,
            msg_inp,
            ibus_tx,
            peer_txp,
        }
    }

    pub(crate) async fn run(mut self, mut msg_rxc: Receiver<ManagerMsg>) {
        while let Some(msg) = msg_rxc.recv().await {
            self.process(msg);
        }
    }

    fn process(&mut self, msg: ManagerMsg) {
        match msg {
            ManagerMsg::Command(msg) => {
                events::process_command(self, msg);
            }
            ManagerMsg::BfdState(msg) => {
                events::process_bfd_update(self, msg.up);
            }
            ManagerMsg::TcpAccept(mut msg) => {
                let stream = msg.stream();
                if let Err(error) =
                    events::process_tcp_accept(self, stream, msg.conn_info)
                {
                    error.log();
                }
            }
            ManagerMsg::TcpConnect(msg) => {
                events::process_tcp_connect(self, msg);
            }
            ManagerMsg::NbrRx(msg) => {
                events::process_nbr_msg(self, msg.direction, msg.msg);
            }
            ManagerMsg::NbrTimer(msg) => {
                events::process_nbr_timer(
                    self,
                    msg.direction,
                    msg.timer,
                    msg.epoch,
                );
            }
            ManagerMsg::Restart(_) => {
                events::process_restart(self);
            }
            ManagerMsg::SendUpdate(msg) => {
                events::process_send_update(self, msg.msg);
            }
        }
    }

    // Returns the session for the given direction, creating it if absent.
    pub(crate) fn session_ensure(
        &mut self,
        direction: Direction,
    ) -> &mut Session {
        self.sessions
            .entry(direction)
            .or_insert_with(|| Session::new(self.remote_addr, direction))
    }

    // Delivers an FSM event to the session of the given direction and
    // post-processes the resulting state transition.
    pub(crate) fn dispatch(
        &mut self,
        direction: Direction,
        event: fsm::Event,
    ) {
        // Automatic restarts apply to connection failures only, never to
        // sessions closed on purpose.
        let auto_restart = !matches!(
            event,
            fsm::Event::ManualStop(..)
                | fsm::Event::AutoStop(..)
                | fsm::Event::OpenCollisionDump
        );

        let SessionManager {
            sessions,
            config,
            instance_cfg,
            peer_type,
            bfd_up,
            msg_inp,
            ibus_tx,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&direction) else {
            return;
        };

        let old_state = session.state;
        let ctx = SessionCtx {
            config,
            instance: instance_cfg,
            peer_type: *peer_type,
            bfd_up: *bfd_up,
            msg_inp,
            ibus_tx,
        };
        let outputs = session.fsm_event(&ctx, event);
        let new_state = session.state;

        // Track the established session and notify the owning peer.
        if new_state == fsm::State::Established
            && old_state != fsm::State::Established
        {
            self.active = Some(direction);
            self.idle_hold_index = IDLE_HOLD_DEFAULT;
            if let Some(conn_info) = self
                .sessions
                .get(&direction)
                .and_then(|session| session.conn_info)
            {
                let _ = self.peer_txp.send(PeerMsg::Established { conn_info });
            }
        } else if old_state == fsm::State::Established
            && self.active == Some(direction)
        {
            self.active = None;
            let _ = self.peer_txp.send(PeerMsg::Broken);
        }

        // Forward coarse state changes for the session the peer observes.
        if new_state != old_state && self.observed(direction) {
            let _ = self
                .peer_txp
                .send(PeerMsg::StateChange { state: new_state });
        }

        // Manager-level actions requested by the session.
        for output in outputs {
            match output {
                Output::CollisionCheck(remote_id) => {
                    self.collision_resolve(direction, remote_id);
                }
                Output::UpdateRcvd(msg) => {
                    let _ = self.peer_txp.send(PeerMsg::UpdateRcvd(msg));
                }
            }
        }

        // A session that fell back to Idle either gets restarted (outbound)
        // or discarded (inbound, since the remote end owns the retries).
        if new_state == fsm::State::Idle && old_state != fsm::State::Idle {
            match direction {
                Direction::Inbound => {
                    self.sessions.remove(&direction);
                }
                Direction::Outbound => {
                    if auto_restart && self.started && self.config.enabled {
                        self.schedule_restart();
                    }
                }
            }
        }
    }

    // The peer observes a single session at a time: the established one
    // when present, the outbound attempt otherwise.
    fn observed(&self, direction: Direction) -> bool {
        match self.active {
            Some(active) => active == direction,
            None => {
                direction == Direction::Outbound
                    || !self.sessions.contains_key(&Direction::Outbound)
            }
        }
    }

    // Resolves a connection collision after a valid OPEN was received on
    // the given direction.
    //
    // An established session always survives. Otherwise the BGP identifiers
    // decide: the side with the lower identifier keeps the inbound
    // connection, the side with the higher one keeps the outbound.
    pub(crate) fn collision_resolve(
        &mut self,
        direction: Direction,
        remote_id: Ipv4Addr,
    ) {
        let other = direction.opposite();
        let Some(other_session) = self.sessions.get(&other) else {
            return;
        };
        if other_session.state < fsm::State::OpenSent {
            return;
        }

        let loser = if other_session.state == fsm::State::Established {
            direction
        } else if u32::from(self.instance_cfg.identifier)
            < u32::from(remote_id)
        {
            Direction::Outbound
        } else {
            Direction::Inbound
        };

        Debug::NbrCollision(&self.remote_addr, loser).log();
        self.dispatch(loser, fsm::Event::OpenCollisionDump);
        self.sessions.remove(&loser);
    }

    pub(crate) fn schedule_restart(&mut self) {
        let seconds = if self.config.damping_enabled {
            let seconds = IDLE_HOLD_LADDER[self.idle_hold_index];
            if self.idle_hold_index < IDLE_HOLD_LADDER.len() - 1 {
                self.idle_hold_index += 1;
            }
            seconds
        } else {
            IDLE_HOLD_LADDER[IDLE_HOLD_DEFAULT]
        };

        Debug::NbrRestartScheduled(&self.remote_addr, seconds).log();
        self.restart = Some(tasks::restart_timer(seconds, &self.msg_inp));
    }
}

// ===== impl ManagerHandle =====

impl ManagerHandle {
    // Spawns the manager task for the given neighbor.
    pub fn spawn(
        remote_addr: IpAddr,
        config: NeighborCfg,
        instance_cfg: InstanceCfg,
        ibus_tx: IbusSender,
        peer_txp: UnboundedSender<PeerMsg>,
    ) -> ManagerHandle {
        let (msg_inp, msg_rxc) = mpsc::channel(4);
        let manager = SessionManager::new(
            remote_addr,
            config,
            instance_cfg,
            msg_inp.clone(),
            ibus_tx,
            peer_txp,
        );
        let span = debug_span!("neighbor", addr = %remote_addr);
        let task = Task::spawn(manager.run(msg_rxc).instrument(span));
        ManagerHandle {
            msg_txp: msg_inp,
            _task: task,
        }
    }

    pub async fn start(&self) {
        let _ = self
            .msg_txp
            .send(ManagerMsg::Command(CommandMsg::Start))
            .await;
    }

    pub async fn stop(&self) {
        let _ = self
            .msg_txp
            .send(ManagerMsg::Command(CommandMsg::Stop))
            .await;
    }

    pub async fn auto_stop(&self, reason: AutoStopReason) {
        let _ = self
            .msg_txp
            .send(ManagerMsg::Command(CommandMsg::AutoStop(reason)))
            .await;
    }

    // Hands over a connection accepted by the shared listening socket.
    pub async fn tcp_accept(&self, msg: TcpAcceptMsg) {
        let _ = self.msg_txp.send(ManagerMsg::TcpAccept(msg)).await;
    }

    pub async fn bfd_state(&self, up: bool) {
        let _ = self
            .msg_txp
            .send(ManagerMsg::BfdState(BfdStateMsg { up }))
            .await;
    }

    pub async fn send_update(&self, msg: UpdateMsg) {
        let _ = self
            .msg_txp
            .send(ManagerMsg::SendUpdate(SendUpdateMsg { msg }))
            .await;
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use wren_utils::UnboundedReceiver;
    use wren_utils::socket::{TcpConnInfo, TcpStream};

    use super::*;
    use crate::packet::consts::BGP_VERSION;
    use crate::packet::message::{KeepaliveMsg, Message, OpenMsg};
    use crate::tasks::messages::input::{TcpAcceptMsg, TcpConnectMsg};

    struct TestManager {
        manager: SessionManager,
        peer_rxc: UnboundedReceiver<PeerMsg>,
        // Keeps the manager mailbox alive for the duration of the test.
        _msg_rxc: Receiver<ManagerMsg>,
    }

    fn manager(local_id: Ipv4Addr) -> TestManager {
        let (msg_inp, msg_rxc) = mpsc::channel(4);
        let (ibus_tx, _ibus_rx) = mpsc::unbounded_channel();
        let (peer_txp, peer_rxc) = mpsc::unbounded_channel();
        let config = NeighborCfg {
            peer_as: 65002,
            ..Default::default()
        };
        let instance_cfg = InstanceCfg {
            asn: 65001,
            identifier: local_id,
        };
        let manager = SessionManager::new(
            IpAddr::from([10, 0, 0, 2]),
            config,
            instance_cfg,
            msg_inp,
            ibus_tx,
            peer_txp,
        );
        TestManager {
            manager,
            peer_rxc,
            _msg_rxc: msg_rxc,
        }
    }

    fn conn_info() -> TcpConnInfo {
        TcpConnInfo {
            local_addr: IpAddr::from([10, 0, 0, 1]),
            local_port: 50000,
            remote_addr: IpAddr::from([10, 0, 0, 2]),
            remote_port: 179,
        }
    }

    fn open_msg(remote_id: Ipv4Addr) -> OpenMsg {
        OpenMsg {
            version: BGP_VERSION,
            my_as: 65002,
            holdtime: 180,
            identifier: remote_id,
            capabilities: Default::default(),
        }
    }

    fn start(mgr: &mut SessionManager) {
        events::process_command(mgr, CommandMsg::Start);
    }

    fn outbound_connected(mgr: &mut SessionManager) {
        let msg = TcpConnectMsg {
            stream: Some(TcpStream::default()),
            conn_info: Some(conn_info()),
        };
        events::process_tcp_connect(mgr, msg);
    }

    fn inbound_accepted(mgr: &mut SessionManager) {
        let mut msg = TcpAcceptMsg {
            stream: Some(TcpStream::default()),
            conn_info: conn_info(),
        };
        let stream = msg.stream();
        events::process_tcp_accept(mgr, stream, msg.conn_info).unwrap();
    }

    fn session_state(
        mgr: &SessionManager,
        direction: Direction,
    ) -> Option<fsm::State> {
        mgr.sessions.get(&direction).map(|session| session.state)
    }

    #[tokio::test]
    async fn collision_lower_local_id_keeps_inbound() {
        let mut test = manager(Ipv4Addr::new(1, 1, 1, 1));
        let mgr = &mut test.manager;

        start(mgr);
        outbound_connected(mgr);
        assert_eq!(
            session_state(mgr, Direction::Outbound),
            Some(fsm::State::OpenSent)
        );

        inbound_accepted(mgr);
        assert_eq!(
            session_state(mgr, Direction::Inbound),
            Some(fsm::State::OpenSent)
        );

        // A valid OPEN on the inbound connection triggers collision
        // resolution. The local identifier is the lower one, so the
        // inbound connection survives.
        events::process_nbr_msg(
            mgr,
            Direction::Inbound,
            Ok(Message::Open(open_msg(Ipv4Addr::new(2, 2, 2, 2)))),
        );
        assert_eq!(
            session_state(mgr, Direction::Inbound),
            Some(fsm::State::OpenConfirm)
        );
        assert_eq!(session_state(mgr, Direction::Outbound), None);
    }

    #[tokio::test]
    async fn collision_higher_local_id_keeps_outbound() {
        let mut test = manager(Ipv4Addr::new(3, 3, 3, 3));
        let mgr = &mut test.manager;

        start(mgr);
        outbound_connected(mgr);
        inbound_accepted(mgr);

        events::process_nbr_msg(
            mgr,
            Direction::Inbound,
            Ok(Message::Open(open_msg(Ipv4Addr::new(2, 2, 2, 2)))),
        );
        assert_eq!(session_state(mgr, Direction::Inbound), None);
        assert_eq!(
            session_state(mgr, Direction::Outbound),
            Some(fsm::State::OpenSent)
        );
    }

    #[tokio::test]
    async fn collision_open_on_outbound_lower_local_id_keeps_inbound() {
        let mut test = manager(Ipv4Addr::new(1, 1, 1, 1));
        let mgr = &mut test.manager;

        start(mgr);
        outbound_connected(mgr);
        inbound_accepted(mgr);

        // The OPEN arrives on the outbound connection this time, with the
        // inbound attempt sitting at OpenSent. The lower local identifier
        // still keeps the inbound connection.
        events::process_nbr_msg(
            mgr,
            Direction::Outbound,
            Ok(Message::Open(open_msg(Ipv4Addr::new(2, 2, 2, 2)))),
        );
        assert_eq!(session_state(mgr, Direction::Outbound), None);
        assert_eq!(
            session_state(mgr, Direction::Inbound),
            Some(fsm::State::OpenSent)
        );
    }

    #[tokio::test]
    async fn collision_open_on_outbound_higher_local_id_keeps_outbound() {
        let mut test = manager(Ipv4Addr::new(3, 3, 3, 3));
        let mgr = &mut test.manager;

        start(mgr);
        outbound_connected(mgr);
        inbound_accepted(mgr);

        events::process_nbr_msg(
            mgr,
            Direction::Outbound,
            Ok(Message::Open(open_msg(Ipv4Addr::new(2, 2, 2, 2)))),
        );
        assert_eq!(session_state(mgr, Direction::Inbound), None);
        assert_eq!(
            session_state(mgr, Direction::Outbound),
            Some(fsm::State::OpenConfirm)
        );
    }

    #[tokio::test]
    async fn collision_established_session_wins() {
        let mut test = manager(Ipv4Addr::new(1, 1, 1, 1));
        let mgr = &mut test.manager;

        start(mgr);
        outbound_connected(mgr);
        events::process_nbr_msg(
            mgr,
            Direction::Outbound,
            Ok(Message::Open(open_msg(Ipv4Addr::new(2, 2, 2, 2)))),
        );
        events::process_nbr_msg(
            mgr,
            Direction::Outbound,
            Ok(Message::Keepalive(KeepaliveMsg {})),
        );
        assert_eq!(
            session_state(mgr, Direction::Outbound),
            Some(fsm::State::Established)
        );

        // Even though the local identifier would keep the inbound
        // connection, the established session always survives.
        inbound_accepted(mgr);
        events::process_nbr_msg(
            mgr,
            Direction::Inbound,
            Ok(Message::Open(open_msg(Ipv4Addr::new(2, 2, 2, 2)))),
        );
        assert_eq!(session_state(mgr, Direction::Inbound), None);
        assert_eq!(
            session_state(mgr, Direction::Outbound),
            Some(fsm::State::Established)
        );

        // Exactly one established notification was delivered.
        let mut established = 0;
        let mut broken = 0;
        while let Ok(msg) = test.peer_rxc.try_recv() {
            match msg {
                PeerMsg::Established { .. } => established += 1,
                PeerMsg::Broken => broken += 1,
                _ => (),
            }
        }
        assert_eq!(established, 1);
        assert_eq!(broken, 0);
    }

    #[tokio::test]
    async fn connect_failure_escalates_idle_hold() {
        let mut test = manager(Ipv4Addr::new(1, 1, 1, 1));
        let mgr = &mut test.manager;
        mgr.config.damping_enabled = true;

        start(mgr);
        assert_eq!(mgr.idle_hold_index, IDLE_HOLD_DEFAULT);

        for attempt in 1..=3 {
            let msg = TcpConnectMsg {
                stream: None,
                conn_info: None,
            };
            events::process_tcp_connect(mgr, msg);
            assert_eq!(
                session_state(mgr, Direction::Outbound),
                Some(fsm::State::Idle)
            );
            assert_eq!(mgr.idle_hold_index, IDLE_HOLD_DEFAULT + attempt);
            events::process_restart(mgr);
            assert_eq!(
                session_state(mgr, Direction::Outbound),
                Some(fsm::State::Connect)
            );
        }

        // The retry counter follows the failed attempts.
        let session = mgr.sessions.get(&Direction::Outbound).unwrap();
        assert_eq!(session.statistics.connect_retries, 3);
    }

    #[tokio::test]
    async fn manual_start_resets_retry_counter() {
        let mut test = manager(Ipv4Addr::new(1, 1, 1, 1));
        let mgr = &mut test.manager;

        start(mgr);
        for _ in 0..3 {
            let msg = TcpConnectMsg {
                stream: None,
                conn_info: None,
            };
            events::process_tcp_connect(mgr, msg);
            events::process_restart(mgr);
        }
        let session = mgr.sessions.get(&Direction::Outbound).unwrap();
        assert_eq!(session.statistics.connect_retries, 3);

        start(mgr);
        let session = mgr.sessions.get(&Direction::Outbound).unwrap();
        assert_eq!(session.statistics.connect_retries, 0);
    }

    #[tokio::test]
    async fn inbound_reconnect_after_connection_failure() {
        let mut test = manager(Ipv4Addr::new(1, 1, 1, 1));
        let mgr = &mut test.manager;

        start(mgr);
        inbound_accepted(mgr);
        assert_eq!(
            session_state(mgr, Direction::Inbound),
            Some(fsm::State::OpenSent)
        );

        // The peer closes the connection before the OPEN exchange.
        events::process_nbr_msg(
            mgr,
            Direction::Inbound,
            Err(crate::error::NbrRxError::TcpConnClosed),
        );
        assert_eq!(
            session_state(mgr, Direction::Inbound),
            Some(fsm::State::Active)
        );

        // A new inbound connection is handed to the waiting session.
        inbound_accepted(mgr);
        assert_eq!(
            session_state(mgr, Direction::Inbound),
            Some(fsm::State::OpenSent)
        );
    }

    #[tokio::test]
    async fn handle_accept_drives_inbound_session() {
        let (ibus_tx, _ibus_rx) = mpsc::unbounded_channel();
        let (peer_txp, mut peer_rxc) = mpsc::unbounded_channel();
        let mut config = NeighborCfg {
            peer_as: 65002,
            ..Default::default()
        };
        config.transport.passive_mode = true;
        let instance_cfg = InstanceCfg {
            asn: 65001,
            identifier: Ipv4Addr::new(1, 1, 1, 1),
        };
        let handle = ManagerHandle::spawn(
            IpAddr::from([10, 0, 0, 2]),
            config,
            instance_cfg,
            ibus_tx,
            peer_txp,
        );

        // In passive mode no outbound attempt is made, so all progress
        // comes from the accepted connection handed over below.
        handle.start().await;
        handle
            .tcp_accept(TcpAcceptMsg {
                stream: Some(TcpStream::default()),
                conn_info: conn_info(),
            })
            .await;

        let mut states = vec![];
        for _ in 0..2 {
            match peer_rxc.recv().await.unwrap() {
                PeerMsg::StateChange { state } => states.push(state),
                msg => panic!("unexpected peer message: {msg:?}"),
            }
        }
        assert_eq!(states, vec![fsm::State::Active, fsm::State::OpenSent]);
    }

    #[tokio::test]
    async fn idle_hold_resets_when_established() {
        let mut test = manager(Ipv4Addr::new(1, 1, 1, 1));
        let mgr = &mut test.manager;
        mgr.config.damping_enabled = true;
        mgr.idle_hold_index = 5;

        start(mgr);
        outbound_connected(mgr);
        events::process_nbr_msg(
            mgr,
            Direction::Outbound,
            Ok(Message::Open(open_msg(Ipv4Addr::new(2, 2, 2, 2)))),
        );
        events::process_nbr_msg(
            mgr,
            Direction::Outbound,
            Ok(Message::Keepalive(KeepaliveMsg {})),
        );
        assert_eq!(mgr.idle_hold_index, IDLE_HOLD_DEFAULT);
    }

    #[tokio::test]
    async fn stale_timer_expiry_is_discarded() {
        let mut test = manager(Ipv4Addr::new(1, 1, 1, 1));
        let mgr = &mut test.manager;

        start(mgr);
        outbound_connected(mgr);
        let epoch = mgr
            .sessions
            .get(&Direction::Outbound)
            .unwrap()
            .timer_epoch;

        // Close the session. The old timer generation is now expired.
        events::process_nbr_msg(
            mgr,
            Direction::Outbound,
            Err(crate::error::NbrRxError::TcpConnClosed),
        );
        assert_eq!(
            session_state(mgr, Direction::Outbound),
            Some(fsm::State::Active)
        );

        let state = session_state(mgr, Direction::Outbound);
        events::process_nbr_timer(
            mgr,
            Direction::Outbound,
            fsm::Timer::Hold,
            epoch,
        );
        assert_eq!(session_state(mgr, Direction::Outbound), state);
    }

    #[tokio::test]
    async fn stop_closes_all_sessions_without_restart() {
        let mut test = manager(Ipv4Addr::new(1, 1, 1, 1));
        let mgr = &mut test.manager;

        start(mgr);
        outbound_connected(mgr);
        inbound_accepted(mgr);

        events::process_command(mgr, CommandMsg::Stop);
        assert_eq!(
            session_state(mgr, Direction::Outbound),
            Some(fsm::State::Idle)
        );
        assert_eq!(session_state(mgr, Direction::Inbound), None);
        assert!(mgr.restart.is_none());
        assert!(!mgr.started);
    }
}

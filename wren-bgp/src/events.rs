//
// Copyright (c) The Wren Project Contributors
//
// SPDX-License-Identifier: MIT
//

use chrono::Utc;
use wren_utils::ip::IpAddrExt;
use wren_utils::socket::{TcpConnInfo, TcpStream};

use crate::debug::Debug;
use crate::error::{Error, IoError, NbrRxError};
use crate::fsm;
use crate::manager::{IDLE_HOLD_DEFAULT, SessionManager};
use crate::network;
use crate::packet::consts::{CeaseSubcode, ErrorCode};
use crate::packet::message::{Message, NotificationMsg, UpdateMsg};
use crate::session::Direction;
use crate::tasks::messages::input::{
    AutoStopReason, CommandMsg, TcpConnectMsg,
};

// ===== peer commands =====

pub(crate) fn process_command(mgr: &mut SessionManager, cmd: CommandMsg) {
    match cmd {
        CommandMsg::Start => {
            mgr.started = true;
            mgr.idle_hold_index = IDLE_HOLD_DEFAULT;
            mgr.restart = None;
            for session in mgr.sessions.values_mut() {
                session.statistics.connect_retries = 0;
            }

            // In passive mode only the remote end initiates connections.
            if !mgr.config.transport.passive_mode {
                mgr.session_ensure(Direction::Outbound);
                mgr.dispatch(Direction::Outbound, fsm::Event::ManualStart);
            }
        }
        CommandMsg::Stop => {
            mgr.started = false;
            mgr.restart = None;

            let msg = NotificationMsg::new(
                ErrorCode::Cease,
                CeaseSubcode::AdministrativeShutdown,
            );
            for direction in
                mgr.sessions.keys().copied().collect::<Vec<_>>()
            {
                mgr.dispatch(
                    direction,
                    fsm::Event::ManualStop(Some(msg.clone())),
                );
            }
        }
        CommandMsg::AutoStop(reason) => {
            let subcode = match reason {
                AutoStopReason::BfdDown => CeaseSubcode::BfdDown,
                AutoStopReason::MaxPrefixesExceeded => {
                    CeaseSubcode::MaximumNumberofPrefixesReached
                }
            };
            let msg = NotificationMsg::new(ErrorCode::Cease, subcode);
            for direction in
                mgr.sessions.keys().copied().collect::<Vec<_>>()
            {
                mgr.dispatch(
                    direction,
                    fsm::Event::AutoStop(msg.clone()),
                );
            }

            // The restart policy depends on the stop reason.
            match reason {
                // Restart once the BFD session comes back up.
                AutoStopReason::BfdDown => (),
                AutoStopReason::MaxPrefixesExceeded => {
                    mgr.schedule_restart();
                }
            }
        }
    }
}

// ===== BFD state update =====

pub(crate) fn process_bfd_update(mgr: &mut SessionManager, up: bool) {
    if mgr.bfd_up == up {
        return;
    }
    mgr.bfd_up = up;

    if !mgr.config.bfd_enabled {
        return;
    }

    if up {
        if mgr.started && !mgr.config.transport.passive_mode {
            mgr.session_ensure(Direction::Outbound);
            mgr.dispatch(Direction::Outbound, fsm::Event::AutoStart);
        }
    } else {
        let msg =
            NotificationMsg::new(ErrorCode::Cease, CeaseSubcode::BfdDown);
        for direction in mgr.sessions.keys().copied().collect::<Vec<_>>() {
            mgr.dispatch(direction, fsm::Event::AutoStop(msg.clone()));
        }
    }
}

// ===== TCP connection request =====

pub(crate) fn process_tcp_accept(
    mgr: &mut SessionManager,
    stream: TcpStream,
    conn_info: TcpConnInfo,
) -> Result<(), Error> {
    // Ignore connections while the neighbor is administratively stopped.
    if !mgr.started || !mgr.config.enabled {
        return Ok(());
    }

    // At most one inbound attempt past the OPEN exchange at a time. An
    // inbound session whose connection failed earlier sits in Active and
    // picks up the new connection instead.
    if let Some(session) = mgr.sessions.get(&Direction::Inbound)
        && session.state >= fsm::State::OpenSent
    {
        return Ok(());
    }

    // Initialize the accepted stream.
    network::accepted_stream_init(
        &stream,
        mgr.remote_addr.address_family(),
        mgr.config.tx_ttl(mgr.peer_type),
        mgr.config.transport.ttl_security,
        mgr.config.transport.tcp_mss,
    )
    .map_err(IoError::TcpSocketError)?;

    // Create the inbound attempt and hand it the connection.
    mgr.session_ensure(Direction::Inbound);
    mgr.dispatch(Direction::Inbound, fsm::Event::ManualStart);
    mgr.dispatch(
        Direction::Inbound,
        fsm::Event::Connected(stream, conn_info),
    );

    Ok(())
}

// ===== TCP connection attempt result =====

pub(crate) fn process_tcp_connect(
    mgr: &mut SessionManager,
    mut msg: TcpConnectMsg,
) {
    // A result for an attempt that was closed in the meantime finds its
    // session in the Idle state, where it is discarded and the socket
    // dropped.
    let event = match msg.conn_info {
        Some(conn_info) => fsm::Event::Connected(msg.stream(), conn_info),
        None => fsm::Event::ConnFail,
    };
    mgr.dispatch(Direction::Outbound, event);
}

// ===== neighbor message receipt =====

pub(crate) fn process_nbr_msg(
    mgr: &mut SessionManager,
    direction: Direction,
    msg: Result<Message, NbrRxError>,
) {
    let event = match msg {
        Ok(msg) => {
            Debug::NbrMsgRx(&mgr.remote_addr, &msg).log();

            // Update statistics.
            if let Some(session) = mgr.sessions.get_mut(&direction) {
                session.statistics.msgs_rcvd.update(&msg);

                // Keep track of the last received notification.
                if let Message::Notification(msg) = &msg {
                    session.notification_rcvd =
                        Some((Utc::now(), msg.clone()));
                }
            }

            match msg {
                Message::Open(msg) => fsm::Event::RcvdOpen(msg),
                Message::Update(msg) => fsm::Event::RcvdUpdate(msg),
                Message::Notification(msg) => fsm::Event::RcvdNotif(msg),
                Message::Keepalive(_) => fsm::Event::RcvdKalive,
            }
        }
        Err(error) => match error {
            NbrRxError::TcpConnClosed => fsm::Event::ConnFail,
            NbrRxError::MsgDecodeError(error) => {
                fsm::Event::RcvdError(error)
            }
        },
    };
    mgr.dispatch(direction, event);
}

// ===== neighbor timeout =====

pub(crate) fn process_nbr_timer(
    mgr: &mut SessionManager,
    direction: Direction,
    timer: fsm::Timer,
    epoch: u64,
) {
    // Discard expiries queued by a timer generation that was already
    // cancelled.
    let Some(session) = mgr.sessions.get(&direction) else {
        return;
    };
    if session.timer_epoch != epoch {
        return;
    }

    mgr.dispatch(direction, fsm::Event::Timer(timer));
}

// ===== automatic restart =====

pub(crate) fn process_restart(mgr: &mut SessionManager) {
    mgr.restart = None;

    if !mgr.started
        || !mgr.config.enabled
        || mgr.config.transport.passive_mode
    {
        return;
    }
    if mgr.config.bfd_enabled && !mgr.bfd_up {
        return;
    }

    mgr.session_ensure(Direction::Outbound);
    mgr.dispatch(Direction::Outbound, fsm::Event::AutoStart);
}

// ===== UPDATE transmission =====

pub(crate) fn process_send_update(mgr: &mut SessionManager, msg: UpdateMsg) {
    // UPDATE messages are transmitted only while a session is established.
    if let Some(direction) = mgr.active
        && let Some(session) = mgr.sessions.get_mut(&direction)
        && session.state == fsm::State::Established
    {
        session.message_send(Message::Update(msg));
    }
}

//
// Copyright (c) The Wren Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};
use wren_utils::socket::{TcpConnInfo, TcpStream};

use crate::error::Error;
use crate::packet::consts::{
    CeaseSubcode, ErrorCode, FsmErrorSubcode, OpenMessageErrorSubcode,
};
use crate::packet::error::DecodeError;
use crate::packet::message::{NotificationMsg, OpenMsg, UpdateMsg};
use crate::session::PeerType;

// Large hold-time advertised while a session is being initialized, before
// the real value is negotiated.
pub const LARGE_HOLDTIME: u16 = 240;

// BGP session states.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum State {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

// BGP session events.
#[derive(Debug)]
pub enum Event {
    ManualStart,
    AutoStart,
    ManualStop(Option<NotificationMsg>),
    AutoStop(NotificationMsg),
    Connected(TcpStream, TcpConnInfo),
    ConnFail,
    RcvdError(DecodeError),
    RcvdOpen(OpenMsg),
    RcvdNotif(NotificationMsg),
    RcvdKalive,
    RcvdUpdate(UpdateMsg),
    OpenCollisionDump,
    Timer(Timer),
}

// BGP session timers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Timer {
    ConnectRetry,
    Hold,
}

// Immutable data consulted by the transition function.
//
// `passive` covers both explicit configuration and inbound attempts, which
// never initiate connections on their own.
#[derive(Clone, Debug)]
pub struct Context {
    pub remote_addr: IpAddr,
    pub local_as: u32,
    pub router_id: Ipv4Addr,
    pub peer_as: u32,
    pub peer_type: PeerType,
    pub holdtime_cfg: u16,
    pub keepalive_cfg: Option<u16>,
    pub passive: bool,
    pub bfd_required: bool,
    pub bfd_up: bool,
}

// Side effects requested by a transition.
//
// The transition function never touches timers, sockets or channels. Those
// are only ever manipulated by the caller, while executing the returned
// effects in order.
#[derive(Debug)]
pub enum Effect {
    ConnectStart,
    ConnectRetryStart,
    ConnectRetryStop,
    HoldTimerStart(u16),
    HoldTimerRestart,
    HoldTimerStop,
    KeepaliveStart(u16),
    ConnectionSetup(TcpStream, TcpConnInfo),
    SessionClose(Option<NotificationMsg>),
    SendOpen,
    SendKeepalive,
    StoreOpen(OpenMsg, Option<u16>),
    CollisionCheck(Ipv4Addr),
    DeliverUpdate(UpdateMsg),
    FlagUnexpectedOpen,
    LogError(Error),
}

// ===== global functions =====

// Computes the next state and the list of side effects for the given event.
//
// Returns `None` as the next state when the event doesn't cause a state
// transition.
pub(crate) fn transition(
    state: State,
    ctx: &Context,
    event: Event,
) -> (Option<State>, Vec<Effect>) {
    match state {
        State::Idle => idle(ctx, event),
        State::Connect => connect(ctx, event),
        State::Active => active(ctx, event),
        State::OpenSent => open_sent(ctx, event),
        State::OpenConfirm => open_confirm(ctx, event),
        State::Established => established(ctx, event),
    }
}

fn idle(ctx: &Context, event: Event) -> (Option<State>, Vec<Effect>) {
    match event {
        Event::ManualStart | Event::AutoStart => {
            let mut effects = vec![Effect::ConnectRetryStart];

            // Don't initiate connections while passive or while the BFD
            // session is down.
            if ctx.passive || (ctx.bfd_required && !ctx.bfd_up) {
                (Some(State::Active), effects)
            } else {
                effects.push(Effect::ConnectStart);
                (Some(State::Connect), effects)
            }
        }
        _ => (None, vec![]),
    }
}

fn connect(_ctx: &Context, event: Event) -> (Option<State>, Vec<Effect>) {
    match event {
        Event::ManualStart | Event::AutoStart => (None, vec![]),
        Event::ManualStop(msg) => {
            (Some(State::Idle), vec![Effect::SessionClose(msg)])
        }
        Event::AutoStop(msg) => {
            (Some(State::Idle), vec![Effect::SessionClose(Some(msg))])
        }
        Event::Connected(stream, conn_info) => {
            connection_setup(stream, conn_info)
        }
        Event::ConnFail => {
            (Some(State::Idle), vec![Effect::SessionClose(None)])
        }
        Event::RcvdError(error) => rcvd_error(error),
        Event::Timer(Timer::ConnectRetry) => {
            (None, vec![Effect::ConnectStart, Effect::ConnectRetryStart])
        }
        _ => (Some(State::Idle), vec![Effect::SessionClose(None)]),
    }
}

fn active(ctx: &Context, event: Event) -> (Option<State>, Vec<Effect>) {
    match event {
        Event::ManualStart | Event::AutoStart => (None, vec![]),
        Event::ManualStop(msg) => {
            (Some(State::Idle), vec![Effect::SessionClose(msg)])
        }
        Event::AutoStop(msg) => {
            (Some(State::Idle), vec![Effect::SessionClose(Some(msg))])
        }
        Event::Connected(stream, conn_info) => {
            connection_setup(stream, conn_info)
        }
        Event::ConnFail => {
            (Some(State::Idle), vec![Effect::SessionClose(None)])
        }
        Event::RcvdError(error) => rcvd_error(error),
        Event::Timer(Timer::ConnectRetry) => {
            if ctx.passive || (ctx.bfd_required && !ctx.bfd_up) {
                (None, vec![Effect::ConnectRetryStart])
            } else {
                (
                    Some(State::Connect),
                    vec![Effect::ConnectStart, Effect::ConnectRetryStart],
                )
            }
        }
        _ => (Some(State::Idle), vec![Effect::SessionClose(None)]),
    }
}

fn open_sent(ctx: &Context, event: Event) -> (Option<State>, Vec<Effect>) {
    match event {
        Event::ManualStart | Event::AutoStart => (None, vec![]),
        Event::ManualStop(msg) => {
            (Some(State::Idle), vec![Effect::SessionClose(msg)])
        }
        Event::AutoStop(msg) => {
            (Some(State::Idle), vec![Effect::SessionClose(Some(msg))])
        }
        Event::ConnFail => {
            // The connection attempt may be retried from the Active state.
            (
                Some(State::Active),
                vec![Effect::SessionClose(None), Effect::ConnectRetryStart],
            )
        }
        Event::RcvdError(error) => rcvd_error(error),
        Event::RcvdOpen(msg) => open_process(ctx, msg),
        Event::RcvdNotif(_) => {
            (Some(State::Idle), vec![Effect::SessionClose(None)])
        }
        Event::OpenCollisionDump => collision_dump(),
        Event::Timer(Timer::Hold) => holdtime_expired(),
        _ => fsm_error(FsmErrorSubcode::UnexpectedMessageInOpenSent),
    }
}

fn open_confirm(_ctx: &Context, event: Event) -> (Option<State>, Vec<Effect>) {
    match event {
        Event::ManualStart | Event::AutoStart => (None, vec![]),
        Event::ManualStop(msg) => {
            (Some(State::Idle), vec![Effect::SessionClose(msg)])
        }
        Event::AutoStop(msg) => {
            (Some(State::Idle), vec![Effect::SessionClose(Some(msg))])
        }
        Event::ConnFail => {
            (Some(State::Idle), vec![Effect::SessionClose(None)])
        }
        Event::RcvdError(error) => rcvd_error(error),
        Event::RcvdOpen(_) => {
            // A second OPEN on the same connection. Flag it and carry on
            // with the original session parameters.
            (None, vec![Effect::FlagUnexpectedOpen])
        }
        Event::RcvdNotif(_) => {
            (Some(State::Idle), vec![Effect::SessionClose(None)])
        }
        Event::RcvdKalive => {
            (Some(State::Established), vec![Effect::HoldTimerRestart])
        }
        Event::OpenCollisionDump => collision_dump(),
        Event::Timer(Timer::Hold) => holdtime_expired(),
        _ => fsm_error(FsmErrorSubcode::UnexpectedMessageInOpenConfirm),
    }
}

fn established(_ctx: &Context, event: Event) -> (Option<State>, Vec<Effect>) {
    match event {
        Event::ManualStart | Event::AutoStart => (None, vec![]),
        Event::ManualStop(msg) => {
            (Some(State::Idle), vec![Effect::SessionClose(msg)])
        }
        Event::AutoStop(msg) => {
            (Some(State::Idle), vec![Effect::SessionClose(Some(msg))])
        }
        Event::ConnFail => {
            (Some(State::Idle), vec![Effect::SessionClose(None)])
        }
        Event::RcvdError(error) => rcvd_error(error),
        Event::RcvdOpen(_) => (None, vec![Effect::FlagUnexpectedOpen]),
        Event::RcvdNotif(_) => {
            (Some(State::Idle), vec![Effect::SessionClose(None)])
        }
        Event::RcvdKalive => (None, vec![Effect::HoldTimerRestart]),
        Event::RcvdUpdate(msg) => {
            (
                None,
                vec![Effect::HoldTimerRestart, Effect::DeliverUpdate(msg)],
            )
        }
        Event::OpenCollisionDump => collision_dump(),
        Event::Timer(Timer::Hold) => holdtime_expired(),
        _ => fsm_error(FsmErrorSubcode::UnexpectedMessageInEstablished),
    }
}

// ===== helper functions =====

fn connection_setup(
    stream: TcpStream,
    conn_info: TcpConnInfo,
) -> (Option<State>, Vec<Effect>) {
    (
        Some(State::OpenSent),
        vec![
            Effect::ConnectRetryStop,
            Effect::ConnectionSetup(stream, conn_info),
            Effect::SendOpen,
            Effect::HoldTimerStart(LARGE_HOLDTIME),
        ],
    )
}

fn open_process(ctx: &Context, msg: OpenMsg) -> (Option<State>, Vec<Effect>) {
    // Validate the received message.
    if let Err(error) = open_validate(ctx, &msg) {
        let notif = match &error {
            Error::NbrBadAs(..) => Some(NotificationMsg::new(
                ErrorCode::OpenMessageError,
                OpenMessageErrorSubcode::BadPeerAs,
            )),
            Error::NbrBadIdentifier(..) => Some(NotificationMsg::new(
                ErrorCode::OpenMessageError,
                OpenMessageErrorSubcode::BadBgpIdentifier,
            )),
            _ => None,
        };
        return (
            Some(State::Idle),
            vec![Effect::LogError(error), Effect::SessionClose(notif)],
        );
    }

    let mut effects = vec![Effect::ConnectRetryStop, Effect::SendKeepalive];

    // Negotiate the hold-time. A value of zero disables the hold timer
    // altogether, but keepalives are still sent when an explicit interval
    // is configured.
    let holdtime = std::cmp::min(msg.holdtime, ctx.holdtime_cfg);
    if holdtime != 0 {
        effects.push(Effect::HoldTimerStart(holdtime));
    } else {
        effects.push(Effect::HoldTimerStop);
    }
    let keepalive = ctx.keepalive_cfg.unwrap_or(holdtime / 3);
    if keepalive != 0 {
        effects.push(Effect::KeepaliveStart(keepalive));
    }

    let identifier = msg.identifier;
    effects
        .push(Effect::StoreOpen(msg, (holdtime != 0).then_some(holdtime)));
    effects.push(Effect::CollisionCheck(identifier));
    (Some(State::OpenConfirm), effects)
}

fn open_validate(ctx: &Context, msg: &OpenMsg) -> Result<(), Error> {
    // Validate the peer AS number.
    if msg.real_as() != ctx.peer_as {
        return Err(Error::NbrBadAs(
            ctx.remote_addr,
            msg.real_as(),
            ctx.peer_as,
        ));
    }

    // Internal peers can't share our BGP identifier.
    if ctx.peer_type == PeerType::Internal && msg.identifier == ctx.router_id {
        return Err(Error::NbrBadIdentifier(ctx.remote_addr, msg.identifier));
    }

    Ok(())
}

fn rcvd_error(error: DecodeError) -> (Option<State>, Vec<Effect>) {
    let msg = NotificationMsg::from(error);
    (Some(State::Idle), vec![Effect::SessionClose(Some(msg))])
}

fn holdtime_expired() -> (Option<State>, Vec<Effect>) {
    let error_code = ErrorCode::HoldTimerExpired;
    let error_subcode = 0;
    let msg = NotificationMsg::new(error_code, error_subcode);
    (Some(State::Idle), vec![Effect::SessionClose(Some(msg))])
}

fn fsm_error(error_subcode: FsmErrorSubcode) -> (Option<State>, Vec<Effect>) {
    let msg =
        NotificationMsg::new(ErrorCode::FiniteStateMachineError, error_subcode);
    (Some(State::Idle), vec![Effect::SessionClose(Some(msg))])
}

fn collision_dump() -> (Option<State>, Vec<Effect>) {
    let msg = NotificationMsg::new(
        ErrorCode::Cease,
        CeaseSubcode::ConnectionCollisionResolution,
    );
    (Some(State::Idle), vec![Effect::SessionClose(Some(msg))])
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use num_traits::ToPrimitive;

    use super::*;
    use crate::packet::consts::{BGP_VERSION, MessageHeaderErrorSubcode};
    use crate::packet::error::MessageHeaderError;

    fn context() -> Context {
        Context {
            remote_addr: IpAddr::from([10, 0, 0, 2]),
            local_as: 65001,
            router_id: Ipv4Addr::new(1, 1, 1, 1),
            peer_as: 65002,
            peer_type: PeerType::External,
            holdtime_cfg: 180,
            keepalive_cfg: None,
            passive: false,
            bfd_required: false,
            bfd_up: false,
        }
    }

    fn open_msg(holdtime: u16) -> OpenMsg {
        OpenMsg {
            version: BGP_VERSION,
            my_as: 65002,
            holdtime,
            identifier: Ipv4Addr::new(2, 2, 2, 2),
            capabilities: Default::default(),
        }
    }

    #[test]
    fn start_initiates_connection() {
        let ctx = context();
        let (state, effects) =
            transition(State::Idle, &ctx, Event::ManualStart);
        assert_eq!(state, Some(State::Connect));
        assert!(matches!(
            effects.as_slice(),
            [Effect::ConnectRetryStart, Effect::ConnectStart]
        ));
    }

    #[test]
    fn start_passive_waits_for_connection() {
        let mut ctx = context();
        ctx.passive = true;
        let (state, effects) =
            transition(State::Idle, &ctx, Event::ManualStart);
        assert_eq!(state, Some(State::Active));
        assert!(matches!(effects.as_slice(), [Effect::ConnectRetryStart]));
    }

    #[test]
    fn start_waits_for_bfd() {
        let mut ctx = context();
        ctx.bfd_required = true;
        let (state, _) = transition(State::Idle, &ctx, Event::ManualStart);
        assert_eq!(state, Some(State::Active));

        // The connect-retry timer doesn't initiate connections either while
        // the BFD session is down.
        let (state, effects) =
            transition(State::Active, &ctx, Event::Timer(Timer::ConnectRetry));
        assert_eq!(state, None);
        assert!(matches!(effects.as_slice(), [Effect::ConnectRetryStart]));
    }

    #[test]
    fn connection_initializes_session() {
        let ctx = context();
        let event =
            Event::Connected(TcpStream::default(), conn_info());
        let (state, effects) = transition(State::Connect, &ctx, event);
        assert_eq!(state, Some(State::OpenSent));
        assert!(matches!(
            effects.as_slice(),
            [
                Effect::ConnectRetryStop,
                Effect::ConnectionSetup(..),
                Effect::SendOpen,
                Effect::HoldTimerStart(LARGE_HOLDTIME),
            ]
        ));
    }

    #[test]
    fn open_negotiates_holdtime() {
        let ctx = context();
        let (state, effects) =
            transition(State::OpenSent, &ctx, Event::RcvdOpen(open_msg(90)));
        assert_eq!(state, Some(State::OpenConfirm));
        assert!(matches!(
            effects.as_slice(),
            [
                Effect::ConnectRetryStop,
                Effect::SendKeepalive,
                Effect::HoldTimerStart(90),
                Effect::KeepaliveStart(30),
                Effect::StoreOpen(_, Some(90)),
                Effect::CollisionCheck(..),
            ]
        ));

        // The negotiated value never exceeds the configured one.
        let (_, effects) =
            transition(State::OpenSent, &ctx, Event::RcvdOpen(open_msg(300)));
        assert!(
            effects
                .iter()
                .any(|e| matches!(e, Effect::HoldTimerStart(180)))
        );
    }

    #[test]
    fn open_holdtime_zero_disables_hold_timer() {
        let ctx = context();
        let (state, effects) =
            transition(State::OpenSent, &ctx, Event::RcvdOpen(open_msg(0)));
        assert_eq!(state, Some(State::OpenConfirm));
        assert!(effects.iter().any(|e| matches!(e, Effect::HoldTimerStop)));
        assert!(
            !effects
                .iter()
                .any(|e| matches!(e, Effect::HoldTimerStart(..)))
        );
        assert!(
            !effects
                .iter()
                .any(|e| matches!(e, Effect::KeepaliveStart(..)))
        );

        // An explicitly configured interval keeps keepalives flowing even
        // with the hold timer disabled.
        let mut ctx = context();
        ctx.keepalive_cfg = Some(10);
        let (_, effects) =
            transition(State::OpenSent, &ctx, Event::RcvdOpen(open_msg(0)));
        assert!(
            effects
                .iter()
                .any(|e| matches!(e, Effect::KeepaliveStart(10)))
        );
    }

    #[test]
    fn open_bad_peer_as() {
        let ctx = context();
        let mut msg = open_msg(180);
        msg.my_as = 65003;
        let (state, effects) =
            transition(State::OpenSent, &ctx, Event::RcvdOpen(msg));
        assert_eq!(state, Some(State::Idle));
        assert!(matches!(
            effects.as_slice(),
            [
                Effect::LogError(Error::NbrBadAs(..)),
                Effect::SessionClose(Some(_)),
            ]
        ));
    }

    #[test]
    fn unexpected_open_is_flagged() {
        let ctx = context();
        for state in [State::OpenConfirm, State::Established] {
            let (next_state, effects) =
                transition(state, &ctx, Event::RcvdOpen(open_msg(180)));
            assert_eq!(next_state, None);
            assert!(matches!(
                effects.as_slice(),
                [Effect::FlagUnexpectedOpen]
            ));
        }
    }

    #[test]
    fn keepalive_establishes_session() {
        let ctx = context();
        let (state, effects) =
            transition(State::OpenConfirm, &ctx, Event::RcvdKalive);
        assert_eq!(state, Some(State::Established));
        assert!(matches!(effects.as_slice(), [Effect::HoldTimerRestart]));
    }

    #[test]
    fn update_restarts_hold_timer() {
        let ctx = context();
        let msg = UpdateMsg {
            reach: None,
            unreach: None,
            mp_reach: None,
            mp_unreach: None,
            attrs: None,
        };
        let (state, effects) =
            transition(State::Established, &ctx, Event::RcvdUpdate(msg));
        assert_eq!(state, None);
        assert!(matches!(
            effects.as_slice(),
            [Effect::HoldTimerRestart, Effect::DeliverUpdate(..)]
        ));
    }

    #[test]
    fn holdtime_expiry_closes_session() {
        let ctx = context();
        let (state, effects) =
            transition(State::Established, &ctx, Event::Timer(Timer::Hold));
        assert_eq!(state, Some(State::Idle));
        let [Effect::SessionClose(Some(msg))] = effects.as_slice() else {
            panic!("unexpected effects: {effects:?}");
        };
        assert_eq!(
            msg.error_code,
            ErrorCode::HoldTimerExpired.to_u8().unwrap()
        );
    }

    #[test]
    fn collision_dump_sends_cease() {
        let ctx = context();
        for state in [State::OpenSent, State::OpenConfirm, State::Established]
        {
            let (next_state, effects) =
                transition(state, &ctx, Event::OpenCollisionDump);
            assert_eq!(next_state, Some(State::Idle));
            let [Effect::SessionClose(Some(msg))] = effects.as_slice() else {
                panic!("unexpected effects: {effects:?}");
            };
            assert_eq!(msg.error_code, ErrorCode::Cease.to_u8().unwrap());
            assert_eq!(
                msg.error_subcode,
                CeaseSubcode::ConnectionCollisionResolution.to_u8().unwrap()
            );
        }
    }

    #[test]
    fn unexpected_message_is_fsm_error() {
        let ctx = context();
        let (state, effects) =
            transition(State::OpenSent, &ctx, Event::RcvdKalive);
        assert_eq!(state, Some(State::Idle));
        let [Effect::SessionClose(Some(msg))] = effects.as_slice() else {
            panic!("unexpected effects: {effects:?}");
        };
        assert_eq!(
            msg.error_code,
            ErrorCode::FiniteStateMachineError.to_u8().unwrap()
        );
        assert_eq!(
            msg.error_subcode,
            FsmErrorSubcode::UnexpectedMessageInOpenSent.to_u8().unwrap()
        );
    }

    #[test]
    fn connect_retry_expiry_reconnects() {
        let ctx = context();
        let (state, effects) =
            transition(State::Connect, &ctx, Event::Timer(Timer::ConnectRetry));
        assert_eq!(state, None);
        assert!(matches!(
            effects.as_slice(),
            [Effect::ConnectStart, Effect::ConnectRetryStart]
        ));

        // From Active the same expiry moves back to Connect.
        let (state, effects) =
            transition(State::Active, &ctx, Event::Timer(Timer::ConnectRetry));
        assert_eq!(state, Some(State::Connect));
        assert!(matches!(
            effects.as_slice(),
            [Effect::ConnectStart, Effect::ConnectRetryStart]
        ));
    }

    #[test]
    fn header_error_closes_session() {
        let ctx = context();
        let error = DecodeError::MessageHeader(
            MessageHeaderError::BadMessageLength(18),
        );
        let (state, effects) =
            transition(State::OpenSent, &ctx, Event::RcvdError(error));
        assert_eq!(state, Some(State::Idle));
        let [Effect::SessionClose(Some(msg))] = effects.as_slice() else {
            panic!("unexpected effects: {effects:?}");
        };
        assert_eq!(
            msg.error_code,
            ErrorCode::MessageHeaderError.to_u8().unwrap()
        );
        assert_eq!(
            msg.error_subcode,
            MessageHeaderErrorSubcode::BadMessageLength.to_u8().unwrap()
        );
    }

    #[test]
    fn transitions_are_deterministic() {
        let ctx = context();
        for _ in 0..2 {
            let (state, effects) = transition(
                State::OpenSent,
                &ctx,
                Event::RcvdOpen(open_msg(90)),
            );
            assert_eq!(state, Some(State::OpenConfirm));
            assert_eq!(effects.len(), 6);
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
}

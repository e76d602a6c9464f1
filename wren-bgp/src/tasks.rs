//
// Copyright (c) The Wren Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{Sender, UnboundedReceiver};
use tracing::{Instrument, debug_span, error};

use crate::config::NeighborCfg;
use crate::debug::Debug;
use crate::error::NbrRxError;
use crate::fsm;
use crate::network;
use crate::packet::message::{
    DecodeCxt, EncodeCxt, KeepaliveMsg, Message, NegotiatedCapability,
};
use crate::session::{PeerType, Session};
use wren_utils::ibus::IbusSender;
use wren_utils::socket::{OwnedReadHalf, OwnedWriteHalf, TcpListener};
use wren_utils::task::{IntervalTask, Task, TimeoutTask};

//
// BGP tasks diagram:
//                                     +--------------+
//                tcp_listener (1x) -> |              |
//                 tcp_connect (Nx) -> |              | -> (Nx) nbr_tx
//                      nbr_rx (Nx) -> |   manager    | -> (Nx) nbr_kalive_interval
//                   nbr_timer (Nx) -> |              |
//               restart_timer (Nx) -> |              |
//                                     +--------------+
//                              ibus_tx (1x) | ^ (1x) ibus_rx
//                                           | |
//                                           V |
//                                     +--------------+
//                                     |     ibus     |
//                                     +--------------+
//

// BGP inter-task message types.
pub mod messages {
    use std::collections::BTreeSet;

    use serde::{Deserialize, Serialize};
    use wren_utils::socket::{TcpConnInfo, TcpStream};

    use crate::error::NbrRxError;
    use crate::fsm;
    use crate::packet::message::{Message, NegotiatedCapability, UpdateMsg};
    use crate::session::Direction;

    // Type aliases.
    pub type ManagerInputMsg = input::ManagerMsg;
    pub type ManagerOutputMsg = output::PeerMsg;

    // Input messages (child task or owning peer -> manager task).
    pub mod input {
        use super::*;

        #[derive(Debug, Deserialize, Serialize)]
        pub enum ManagerMsg {
            Command(CommandMsg),
            BfdState(BfdStateMsg),
            TcpAccept(TcpAcceptMsg),
            TcpConnect(TcpConnectMsg),
            NbrRx(NbrRxMsg),
            NbrTimer(NbrTimerMsg),
            Restart(()),
            SendUpdate(SendUpdateMsg),
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub enum CommandMsg {
            Start,
            Stop,
            AutoStop(AutoStopReason),
        }

        // Reason for tearing down the sessions without operator
        // intervention. Affects the restart policy.
        #[derive(Clone, Copy, Debug, Eq, PartialEq)]
        #[derive(Deserialize, Serialize)]
        pub enum AutoStopReason {
            BfdDown,
            MaxPrefixesExceeded,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct BfdStateMsg {
            pub up: bool,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct TcpAcceptMsg {
            #[serde(skip)]
            pub stream: Option<TcpStream>,
            pub conn_info: TcpConnInfo,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct TcpConnectMsg {
            #[serde(skip)]
            pub stream: Option<TcpStream>,
            // `None` indicates the connection attempt has failed.
            pub conn_info: Option<TcpConnInfo>,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NbrRxMsg {
            pub direction: Direction,
            pub msg: Result<Message, NbrRxError>,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NbrTimerMsg {
            pub direction: Direction,
            pub timer: fsm::Timer,
            pub epoch: u64,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct SendUpdateMsg {
            pub msg: UpdateMsg,
        }

        impl TcpAcceptMsg {
            pub fn stream(&mut self) -> TcpStream {
                #[cfg(not(feature = "testing"))]
                {
                    self.stream.take().unwrap()
                }
                #[cfg(feature = "testing")]
                {
                    Default::default()
                }
            }
        }

        impl TcpConnectMsg {
            pub fn stream(&mut self) -> TcpStream {
                #[cfg(not(feature = "testing"))]
                {
                    self.stream.take().unwrap()
                }
                #[cfg(feature = "testing")]
                {
                    Default::default()
                }
            }
        }
    }

    // Output messages (manager task -> child task or owning peer).
    pub mod output {
        use super::*;

        #[derive(Debug, Serialize)]
        pub enum NbrTxMsg {
            SendMessage { msg: Message },
            UpdateCapabilities(BTreeSet<NegotiatedCapability>),
        }

        // Session notifications delivered to the owning peer.
        #[derive(Debug, Serialize)]
        pub enum PeerMsg {
            Established { conn_info: TcpConnInfo },
            Broken,
            StateChange { state: fsm::State },
            UpdateRcvd(UpdateMsg),
        }
    }
}

// ===== BGP tasks =====

// TCP listening task.
//
// Accepted connections are delivered to the owner, which routes each one
// to the session manager of the matching neighbor via
// [`crate::manager::ManagerHandle::tcp_accept`].
pub fn tcp_listener(
    session_socket: &Arc<TcpListener>,
    tcp_acceptp: &Sender<messages::input::TcpAcceptMsg>,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("session");
        let _span1_guard = span1.enter();
        let span2 = debug_span!("input");
        let _span2_guard = span2.enter();

        let session_socket = session_socket.clone();
        let tcp_acceptp = tcp_acceptp.clone();
        Task::spawn(
            async move {
                let _ = network::listen_loop(session_socket, tcp_acceptp).await;
            }
            .in_current_span(),
        )
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}

// TCP connect task.
//
// A single connection attempt is made. Success or failure is reported back
// to the manager, which decides whether and when to retry.
pub(crate) fn tcp_connect(
    sess: &Session,
    config: &NeighborCfg,
    peer_type: PeerType,
    ibus_tx: &IbusSender,
    msg_inp: &Sender<messages::input::ManagerMsg>,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span = debug_span!("neighbor", addr = %sess.remote_addr);
        let _span_guard = span.enter();

        let remote_addr = sess.remote_addr;
        let local_addr = config.transport.local_addr;
        let ifname = config.transport.ifname.clone();
        let ttl = config.tx_ttl(peer_type);
        let ttl_security = config.transport.ttl_security;
        let tcp_mss = config.transport.tcp_mss;
        let tcp_password = config.transport.md5_key.clone();
        let connect_retry = config.timers.connect_retry_interval;
        let ibus_tx = ibus_tx.clone();
        let msg_inp = msg_inp.clone();
        Task::spawn(
            async move {
                let result = network::connect(
                    remote_addr,
                    local_addr,
                    &ifname,
                    ttl,
                    ttl_security,
                    tcp_mss,
                    &tcp_password,
                    connect_retry,
                    &ibus_tx,
                )
                .await;

                let msg = match result {
                    Ok((stream, conn_info)) => messages::input::TcpConnectMsg {
                        stream: Some(stream),
                        conn_info: Some(conn_info),
                    },
                    Err(error) => {
                        error.log();
                        messages::input::TcpConnectMsg {
                            stream: None,
                            conn_info: None,
                        }
                    }
                };
                let _ = msg_inp
                    .send(messages::input::ManagerMsg::TcpConnect(msg))
                    .await;
            }
            .in_current_span(),
        )
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}

// Neighbor TCP Rx task.
pub(crate) fn nbr_rx(
    sess: &Session,
    cxt: DecodeCxt,
    local_caps: BTreeSet<NegotiatedCapability>,
    read_half: OwnedReadHalf,
    msg_inp: &Sender<messages::input::ManagerMsg>,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("neighbor", addr = %sess.remote_addr);
        let _span1_guard = span1.enter();
        let span2 = debug_span!("input");
        let _span2_guard = span2.enter();

        let direction = sess.direction;
        let msg_inp = msg_inp.clone();

        // Spawn a supervised task for this connection.
        //
        // The TCP read loop runs inside an inner supervised task, which lets
        // us catch panics (for example, from malformed or malicious input)
        // and handle them gracefully. Rather than propagating the panic, we
        // treat it as if the TCP connection was closed, containing the
        // failure.
        Task::spawn(
            async move {
                let worker_task = {
                    let msg_inp = msg_inp.clone();
                    Task::spawn(async move {
                        let _ = network::nbr_read_loop(
                            read_half, direction, cxt, local_caps, msg_inp,
                        )
                        .await;
                    })
                };
                if let Err(error) = worker_task.await
                    && error.is_panic()
                {
                    error!(%error, "task panicked");
                    let msg = messages::input::NbrRxMsg {
                        direction,
                        msg: Err(NbrRxError::TcpConnClosed),
                    };
                    let _ = msg_inp
                        .send(messages::input::ManagerMsg::NbrRx(msg))
                        .await;
                }
            }
            .in_current_span(),
        )
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}

// Neighbor TCP Tx task.
#[cfg_attr(not(feature = "testing"), allow(unused_mut))]
pub(crate) fn nbr_tx(
    sess: &Session,
    cxt: EncodeCxt,
    write_half: OwnedWriteHalf,
    mut msg_txc: UnboundedReceiver<messages::output::NbrTxMsg>,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("neighbor", addr = %sess.remote_addr);
        let _span1_guard = span1.enter();
        let span2 = debug_span!("output");
        let _span2_guard = span2.enter();

        Task::spawn(
            async move {
                network::nbr_write_loop(write_half, cxt, msg_txc).await;
            }
            .in_current_span(),
        )
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move {
            // Drain the channel so sends never fail.
            while msg_txc.recv().await.is_some() {}
        })
    }
}

// Neighbor timer task.
pub(crate) fn nbr_timer(
    sess: &Session,
    timer: fsm::Timer,
    seconds: u16,
    msg_inp: &Sender<messages::input::ManagerMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let msg_inp = msg_inp.clone();
        let direction = sess.direction;
        let epoch = sess.timer_epoch;

        TimeoutTask::new(
            Duration::from_secs(seconds.into()),
            move || async move {
                let msg = messages::input::NbrTimerMsg {
                    direction,
                    timer,
                    epoch,
                };
                let _ = msg_inp
                    .send(messages::input::ManagerMsg::NbrTimer(msg))
                    .await;
            },
        )
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Send periodic keepalive messages.
pub(crate) fn nbr_kalive_interval(
    sess: &Session,
    interval: u16,
) -> IntervalTask {
    #[cfg(not(feature = "testing"))]
    {
        let msg_txp = sess.msg_txp.as_ref().unwrap().clone();
        let nbr_addr = sess.remote_addr;
        let msg_counter = sess.statistics.msgs_sent.total.clone();

        IntervalTask::new(
            Duration::from_secs(interval.into()),
            move || {
                let msg_txp = msg_txp.clone();
                let msg_counter = msg_counter.clone();

                async move {
                    let msg = Message::Keepalive(KeepaliveMsg {});
                    Debug::NbrMsgTx(&nbr_addr, &msg).log();

                    let msg = messages::output::NbrTxMsg::SendMessage { msg };
                    let _ = msg_txp.send(msg);
                    msg_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            },
        )
    }
    #[cfg(feature = "testing")]
    {
        IntervalTask {}
    }
}

// Automatic restart timer task.
pub(crate) fn restart_timer(
    seconds: u16,
    msg_inp: &Sender<messages::input::ManagerMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let msg_inp = msg_inp.clone();

        TimeoutTask::new(
            Duration::from_secs(seconds.into()),
            move || async move {
                let _ = msg_inp
                    .send(messages::input::ManagerMsg::Restart(()))
                    .await;
            },
        )
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

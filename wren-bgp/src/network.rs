//
// Copyright (c) The Wren Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{Sender, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep, timeout};
use wren_utils::ibus::{IbusMsg, IbusSender, NexthopInfo};
use wren_utils::ip::{AddressFamily, IpAddrExt};
use wren_utils::socket::{
    OwnedReadHalf, OwnedWriteHalf, TTL_MAX, TcpConnInfo, TcpListener,
    TcpSocket, TcpSocketExt, TcpStream, TcpStreamExt,
};

use crate::error::{Error, IoError, NbrRxError};
use crate::packet::message::{
    DecodeCxt, EncodeCxt, Message, NegotiatedCapability, rx_capabilities,
};
use crate::session::Direction;
use crate::tasks::messages::input::{ManagerMsg, NbrRxMsg, TcpAcceptMsg};
use crate::tasks::messages::output::NbrTxMsg;

const BGP_PORT: u16 = 179;

// How long to wait before asking the routing component again whether the
// neighbor became reachable.
const REACHABILITY_RETRY_INTERVAL: Duration = Duration::from_secs(3);

// Deadline for reading the fixed-size message header. Expiry isn't an error,
// it only bounds how long a single read may block.
const HDR_READ_TIMEOUT: Duration = Duration::from_secs(3);

// Minimum connection attempt budget, in seconds.
const CONNECT_DEADLINE_MIN: u64 = 10;

// ===== global functions =====

pub fn listen_socket(
    af: AddressFamily,
) -> Result<TcpListener, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        // Create TCP socket.
        let socket = socket(af)?;

        // Bind socket.
        let sockaddr = SocketAddr::from((IpAddr::unspecified(af), BGP_PORT));
        socket.set_reuseaddr(true)?;
        socket.bind(sockaddr)?;

        // GTSM Procedure: set TTL to max for outgoing packets.
        match af {
            AddressFamily::Ipv4 => {
                socket.set_ipv4_ttl(TTL_MAX)?;
            }
            AddressFamily::Ipv6 => {
                socket.set_ipv6_unicast_hops(TTL_MAX)?;
            }
        }

        // Convert the socket into a TcpListener.
        let socket = socket.listen(4096)?;

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(TcpListener::default())
    }
}

pub fn listen_socket_md5sig_update(
    socket: &TcpListener,
    nbr_addr: &IpAddr,
    password: Option<&str>,
) {
    #[cfg(not(feature = "testing"))]
    {
        use wren_utils::socket::TcpListenerExt;

        if let Err(error) = socket.set_md5sig(nbr_addr, password) {
            IoError::TcpAuthError(error).log();
        }
    }
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn listen_loop(
    listener: Arc<TcpListener>,
    tcp_acceptp: Sender<TcpAcceptMsg>,
) -> Result<(), SendError<TcpAcceptMsg>> {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => match stream.conn_info() {
                Ok(conn_info) => {
                    let msg = TcpAcceptMsg {
                        stream: Some(stream),
                        conn_info,
                    };
                    tcp_acceptp.send(msg).await?;
                }
                Err(error) => {
                    IoError::TcpInfoError(error).log();
                }
            },
            Err(error) => {
                IoError::TcpAcceptError(error).log();
            }
        }
    }
}

pub(crate) fn accepted_stream_init(
    stream: &TcpStream,
    af: AddressFamily,
    ttl: u8,
    ttl_security: Option<u8>,
    tcp_mss: Option<u16>,
) -> Result<(), std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        // Set TTL.
        match af {
            AddressFamily::Ipv4 => stream.set_ipv4_ttl(ttl)?,
            AddressFamily::Ipv6 => stream.set_ipv6_unicast_hops(ttl)?,
        }

        // Set TTL security check.
        if let Some(ttl_security_hops) = ttl_security {
            let ttl = TTL_MAX - ttl_security_hops + 1;
            match af {
                AddressFamily::Ipv4 => stream.set_ipv4_minttl(ttl)?,
                AddressFamily::Ipv6 => stream.set_ipv6_min_hopcount(ttl)?,
            }
        }

        // Set the TCP Maximum Segment Size.
        if let Some(tcp_mss) = tcp_mss {
            stream.set_mss(tcp_mss.into())?;
        }
    }

    Ok(())
}

#[cfg(not(feature = "testing"))]
#[allow(clippy::too_many_arguments)]
pub(crate) async fn connect(
    remote_addr: IpAddr,
    local_addr: Option<IpAddr>,
    ifname: &Option<String>,
    ttl: u8,
    ttl_security: Option<u8>,
    tcp_mss: Option<u16>,
    tcp_password: &Option<String>,
    connect_retry_secs: u16,
    ibus_tx: &IbusSender,
) -> Result<(TcpStream, TcpConnInfo), Error> {
    let af = remote_addr.address_family();
    let deadline =
        std::cmp::max(CONNECT_DEADLINE_MIN, connect_retry_secs.into());
    let started = Instant::now();

    // Wait until the routing component reports the neighbor as reachable,
    // giving up once the attempt budget is exhausted.
    let nexthop = loop {
        if let Some(nexthop) =
            nexthop_query(ibus_tx, remote_addr, ifname).await
        {
            break nexthop;
        }
        if started.elapsed() + REACHABILITY_RETRY_INTERVAL
            >= Duration::from_secs(deadline)
        {
            return Err(Error::NbrUnreachable(remote_addr));
        }
        sleep(REACHABILITY_RETRY_INTERVAL).await;
    };

    // Resolve the local address used to bind the connection.
    let local_addr = match local_addr {
        Some(addr) => {
            // An explicitly configured address must be assigned to the host.
            if !addr_ownership_query(ibus_tx, addr).await {
                return Err(Error::NbrLocalAddrMissing(remote_addr, addr));
            }
            Some(addr)
        }
        // Directly attached neighbors are reported with the unspecified
        // address as their nexthop. Bind to the egress interface address
        // in that case.
        None if nexthop.nexthop.is_unspecified() => nexthop.local,
        None => None,
    };

    // Create TCP socket.
    let socket = socket(af).map_err(IoError::TcpSocketError)?;

    // Bind socket.
    if let Some(local_addr) = local_addr {
        let sockaddr = SocketAddr::from((local_addr, 0));
        socket
            .set_reuseaddr(true)
            .map_err(IoError::TcpSocketError)?;
        socket.bind(sockaddr).map_err(IoError::TcpSocketError)?;
    }

    // Set TTL.
    match af {
        AddressFamily::Ipv4 => socket.set_ipv4_ttl(ttl),
        AddressFamily::Ipv6 => socket.set_ipv6_unicast_hops(ttl),
    }
    .map_err(IoError::TcpSocketError)?;

    // Set TTL security check.
    if let Some(ttl_security_hops) = ttl_security {
        let ttl = TTL_MAX - ttl_security_hops + 1;
        match af {
            AddressFamily::Ipv4 => socket.set_ipv4_minttl(ttl),
            AddressFamily::Ipv6 => socket.set_ipv6_min_hopcount(ttl),
        }
        .map_err(IoError::TcpSocketError)?;
    }

    // Set the TCP Maximum Segment Size.
    if let Some(tcp_mss) = tcp_mss {
        socket
            .set_mss(tcp_mss.into())
            .map_err(IoError::TcpSocketError)?;
    }

    // Set the TCP MD5 password.
    if let Some(tcp_password) = tcp_password {
        socket
            .set_md5sig(&remote_addr, Some(tcp_password.as_str()))
            .map_err(IoError::TcpAuthError)?;
    }

    // Connect to the remote address on the BGP port, bounded by the
    // remainder of the attempt budget.
    let sockaddr = SocketAddr::from((remote_addr, BGP_PORT));
    let remaining =
        Duration::from_secs(deadline).saturating_sub(started.elapsed());
    let stream = timeout(remaining, socket.connect(sockaddr))
        .await
        .map_err(|_| {
            IoError::TcpConnectError(std::io::Error::from(
                std::io::ErrorKind::TimedOut,
            ))
        })?
        .map_err(IoError::TcpConnectError)?;

    // Obtain TCP connection address/port information.
    let conn_info = stream.conn_info().map_err(IoError::TcpInfoError)?;

    Ok((stream, conn_info))
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn nbr_write_loop(
    mut stream: OwnedWriteHalf,
    mut cxt: EncodeCxt,
    mut nbr_msg_txc: UnboundedReceiver<NbrTxMsg>,
) {
    while let Some(msg) = nbr_msg_txc.recv().await {
        match msg {
            // Send message to the peer.
            NbrTxMsg::SendMessage { msg } => {
                let buf = msg.encode(&cxt);
                if let Err(error) = stream.write_all(&buf).await {
                    IoError::TcpSendError(error).log();
                }
            }
            // Update negotiated capabilities.
            NbrTxMsg::UpdateCapabilities(caps) => cxt.capabilities = caps,
        }
    }
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn nbr_read_loop(
    mut stream: OwnedReadHalf,
    direction: Direction,
    mut cxt: DecodeCxt,
    local_caps: BTreeSet<NegotiatedCapability>,
    msg_inp: Sender<ManagerMsg>,
) -> Result<(), SendError<ManagerMsg>> {
    let mut header = [0; Message::MIN_LEN as usize];

    'conn: loop {
        // Read the fixed-size message header. A deadline expiry with no
        // data pending only means the peer is quiet, so poll again.
        let mut read = 0;
        while read < header.len() {
            match timeout(HDR_READ_TIMEOUT, stream.read(&mut header[read..]))
                .await
            {
                Err(_) => continue,
                Ok(Ok(0)) => break 'conn,
                Ok(Ok(num_bytes)) => read += num_bytes,
                Ok(Err(error)) => {
                    IoError::TcpRecvError(error).log();
                    break 'conn;
                }
            }
        }

        // Read the message body, if any. Its length was already announced
        // in the header, so no deadline applies here.
        let msg_len =
            u16::from_be_bytes([header[16], header[17]]) as usize;
        let mut data = header.to_vec();
        if (header.len() + 1..=Message::MAX_LEN as usize).contains(&msg_len) {
            data.resize(msg_len, 0);
            if let Err(error) =
                stream.read_exact(&mut data[header.len()..]).await
            {
                IoError::TcpRecvError(error).log();
                break 'conn;
            }
        }

        // Decode the message.
        let msg =
            Message::decode(&data, &cxt).map_err(NbrRxError::MsgDecodeError);

        // Keep track of the negotiated capabilities as they influence how
        // some messages should be decoded.
        if let Ok(Message::Open(msg)) = &msg {
            let rcvd = msg
                .capabilities
                .iter()
                .map(|cap| cap.as_negotiated())
                .collect::<BTreeSet<_>>();
            cxt.capabilities = rx_capabilities(&local_caps, &rcvd);
        }

        // Notify that the BGP message was received.
        let msg = NbrRxMsg { direction, msg };
        msg_inp.send(ManagerMsg::NbrRx(msg)).await?;
    }

    // Notify that the connection was closed by the remote end.
    let msg = NbrRxMsg {
        direction,
        msg: Err(NbrRxError::TcpConnClosed),
    };
    msg_inp.send(ManagerMsg::NbrRx(msg)).await?;
    Ok(())
}

// ===== helper functions =====

// Builds a nexthop resolution request for the routing component.
pub(crate) fn nexthop_request(
    addr: IpAddr,
    ifname: Option<String>,
) -> (IbusMsg, oneshot::Receiver<Option<NexthopInfo>>) {
    let (responder, receiver) = oneshot::channel();
    (
        IbusMsg::NexthopQuery {
            addr,
            ifname,
            responder,
        },
        receiver,
    )
}

#[cfg(not(feature = "testing"))]
async fn nexthop_query(
    ibus_tx: &IbusSender,
    addr: IpAddr,
    ifname: &Option<String>,
) -> Option<NexthopInfo> {
    let (msg, receiver) = nexthop_request(addr, ifname.clone());
    let _ = ibus_tx.send(msg);
    receiver.await.ok().flatten()
}

#[cfg(not(feature = "testing"))]
async fn addr_ownership_query(ibus_tx: &IbusSender, addr: IpAddr) -> bool {
    let (responder, receiver) = oneshot::channel();
    let _ = ibus_tx.send(IbusMsg::AddrOwnershipQuery { addr, responder });
    receiver.await.unwrap_or(false)
}

#[cfg(not(feature = "testing"))]
fn socket(af: AddressFamily) -> Result<TcpSocket, std::io::Error> {
    let socket = match af {
        AddressFamily::Ipv4 => TcpSocket::new_v4()?,
        AddressFamily::Ipv6 => {
            let socket = TcpSocket::new_v6()?;
            socket.set_ipv6_only(true)?;
            socket
        }
    };

    // Set socket options.
    match af {
        AddressFamily::Ipv4 => {
            socket.set_ipv4_tos(libc::IPTOS_PREC_INTERNETCONTROL)?;
        }
        AddressFamily::Ipv6 => {
            socket.set_ipv6_tclass(libc::IPTOS_PREC_INTERNETCONTROL)?;
        }
    }

    Ok(socket)
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nexthop_query_carries_bound_interface() {
        let addr = IpAddr::from([10, 0, 0, 2]);
        let (msg, _receiver) = nexthop_request(addr, Some("eth0".to_owned()));
        let IbusMsg::NexthopQuery {
            addr: query_addr,
            ifname,
            ..
        } = msg
        else {
            panic!("unexpected ibus message");
        };
        assert_eq!(query_addr, addr);
        assert_eq!(ifname.as_deref(), Some("eth0"));
    }
}

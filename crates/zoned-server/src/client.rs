//! Uniform response side of both transports.
//!
//! A client remembers the flag set and request-type byte of the packet
//! it was built for and reapplies the transform pipeline's egress side
//! on every send; a TCP client serves exactly one response and is then
//! closed.

use std::{net::SocketAddr, sync::Arc};

use eyre::WrapErr as _;
use tokio::{
	io::AsyncWriteExt as _,
	net::{TcpStream, UdpSocket},
};
use zoned_core::types::Protocol;
use zoned_proto::{PacketFlags, RequestKind, Response, seal_frame};

enum Transport {
	Tcp(TcpStream),
	Udp(Arc<UdpSocket>),
}

pub struct Client {
	transport: Transport,
	peer:      SocketAddr,
	kind:      RequestKind,
	flags:     PacketFlags,
}

impl Client {
	pub fn tcp(stream: TcpStream, peer: SocketAddr) -> Self {
		Self {
			transport: Transport::Tcp(stream),
			peer,
			kind: RequestKind::Other(0xff),
			flags: PacketFlags::empty(),
		}
	}

	pub fn udp(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
		Self {
			transport: Transport::Udp(socket),
			peer,
			kind: RequestKind::Other(0xff),
			flags: PacketFlags::empty(),
		}
	}

	pub fn protocol(&self) -> Protocol {
		match self.transport {
			Transport::Tcp(..) => Protocol::Tcp,
			Transport::Udp(..) => Protocol::Udp,
		}
	}

	pub fn peer(&self) -> SocketAddr {
		self.peer
	}

	pub fn flags(&self) -> PacketFlags {
		self.flags
	}

	/// Adopts the ingress frame's type byte and flag set for egress.
	pub fn set_context(&mut self, kind: RequestKind, flags: PacketFlags) {
		self.kind = kind;
		self.flags = flags;
	}

	/// Frames, transforms and writes one response. Returns the number
	/// of bytes put on the wire.
	pub async fn send(&mut self, response: &Response, key: &[u8; 32]) -> eyre::Result<usize> {
		let packet = seal_frame(self.kind, self.flags, &response.to_value(), key)
			.wrap_err("failed to seal response frame")?;
		match &mut self.transport {
			Transport::Tcp(stream) => {
				stream.write_all(&packet).await.wrap_err("tcp response write failed")?;
				stream.flush().await.wrap_err("tcp response flush failed")?;
			}
			Transport::Udp(socket) => {
				socket
					.send_to(&packet, self.peer)
					.await
					.wrap_err("udp response send failed")?;
			}
		}
		Ok(packet.len())
	}

	/// TCP connections close after their single response; UDP has
	/// nothing to tear down.
	pub async fn close(&mut self) {
		if let Transport::Tcp(stream) = &mut self.transport {
			let _ = stream.shutdown().await;
		}
	}
}

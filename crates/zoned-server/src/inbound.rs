//! Dual-transport listener.
//!
//! One loop serves both sockets bound to the same port: accepted TCP
//! connections carry exactly one request each and are read step by
//! step with a per-step timeout; UDP datagrams arrive whole. Every
//! request runs as its own tracked task.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use eyre::WrapErr as _;
use tokio::{
	io::{AsyncRead, AsyncReadExt as _},
	net::{TcpListener, TcpStream, UdpSocket},
};
use tokio_util::sync::CancellationToken;
use zoned_core::{AppContext, debug, error, info};
use zoned_proto::{HEADER_LEN, MAGIC};

use crate::{client::Client, dispatch, services::Services};

const DRAIN_LIMIT: usize = 64 * 1024;
const MAX_DATAGRAM: usize = 65536;

pub struct InboundOpts {
	pub listen_addr:  SocketAddr,
	/// Per-read-step timeout on the TCP path.
	pub read_timeout: Duration,
}

impl Default for InboundOpts {
	fn default() -> Self {
		Self {
			listen_addr:  "0.0.0.0:4242".parse().unwrap(),
			read_timeout: Duration::from_secs(5),
		}
	}
}

pub struct Inbound {
	ctx:      Arc<AppContext>,
	opts:     InboundOpts,
	services: Services,
	cancel:   CancellationToken,
}

impl Inbound {
	pub fn new(ctx: Arc<AppContext>, opts: InboundOpts, services: Services) -> Self {
		Self {
			cancel: ctx.token.child_token(),
			ctx,
			opts,
			services,
		}
	}

	pub async fn listen(&self) -> eyre::Result<()> {
		let tcp = TcpListener::bind(self.opts.listen_addr)
			.await
			.wrap_err_with(|| format!("failed to bind tcp listener on {}", self.opts.listen_addr))?;
		let udp = Arc::new(
			UdpSocket::bind(self.opts.listen_addr)
				.await
				.wrap_err_with(|| format!("failed to bind udp socket on {}", self.opts.listen_addr))?,
		);

		info!(target: "[LISTEN]", "serving tcp+udp on {}", self.opts.listen_addr);

		let mut datagram = vec![0u8; MAX_DATAGRAM];
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => {
					info!(target: "[LISTEN]", "listener shutting down");
					break;
				}
				accepted = tcp.accept() => match accepted {
					Ok((stream, peer)) => {
						let services = self.services.clone();
						let read_timeout = self.opts.read_timeout;
						self.ctx.tasks.spawn(async move {
							handle_tcp(stream, peer, services, read_timeout).await;
						});
					}
					Err(err) => error!(target: "[LISTEN]", "tcp accept failed: {err}"),
				},
				received = udp.recv_from(&mut datagram) => match received {
					Ok((len, peer)) => {
						// Anything that does not open with the magic is
						// dropped without a reply, so the socket cannot
						// be used for amplification.
						if !datagram[..len].starts_with(&MAGIC) {
							continue;
						}
						let raw = BytesMut::from(&datagram[..len]);
						let client = Client::udp(udp.clone(), peer);
						let services = self.services.clone();
						self.ctx.tasks.spawn(async move {
							dispatch::handle_packet(services, client, raw).await;
						});
					}
					Err(err) => error!(target: "[LISTEN]", "udp receive failed: {err}"),
				},
			}
		}

		Ok(())
	}
}

/// Step-reads one framed request off a fresh TCP connection.
async fn handle_tcp(mut stream: TcpStream, peer: SocketAddr, services: Services, step: Duration) {
	let mut header = [0u8; HEADER_LEN as usize];

	if read_exact_step(&mut stream, &mut header[..2], step).await.is_err() {
		return;
	}
	if header[..2] != MAGIC {
		drain(&mut stream, step).await;
		dispatch::respond_invalid(&services, Client::tcp(stream, peer)).await;
		return;
	}

	if read_exact_step(&mut stream, &mut header[2..3], step).await.is_err() {
		return;
	}
	if header[2] != HEADER_LEN {
		debug!(target: "[LISTEN]", "{} sent header length {}", peer, header[2]);
		return;
	}

	if read_exact_step(&mut stream, &mut header[3..], step).await.is_err() {
		return;
	}
	let content_len = u16::from_be_bytes([header[5], header[6]]) as usize;

	let mut body = vec![0u8; content_len];
	if read_exact_step(&mut stream, &mut body, step).await.is_err() {
		return;
	}

	let mut raw = BytesMut::with_capacity(HEADER_LEN as usize + content_len);
	raw.extend_from_slice(&header);
	raw.extend_from_slice(&body);

	dispatch::handle_packet(services, Client::tcp(stream, peer), raw).await;
}

async fn read_exact_step<S>(stream: &mut S, buf: &mut [u8], step: Duration) -> Result<(), ()>
where
	S: AsyncRead + Unpin,
{
	match tokio::time::timeout(step, stream.read_exact(buf)).await {
		Ok(Ok(_)) => Ok(()),
		Ok(Err(err)) => {
			debug!(target: "[LISTEN]", "tcp read failed: {err}");
			Err(())
		}
		Err(_) => {
			debug!(target: "[LISTEN]", "tcp read timed out");
			Err(())
		}
	}
}

/// Swallows whatever else the peer pushed after a bad magic, bounded
/// so a hostile connection cannot pin the task.
async fn drain<S>(stream: &mut S, step: Duration)
where
	S: AsyncRead + Unpin,
{
	let mut sink = vec![0u8; DRAIN_LIMIT];
	let _ = tokio::time::timeout(step, stream.read(&mut sink)).await;
}

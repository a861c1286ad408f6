use std::net::SocketAddr;
use std::thread::JoinHandle;

use async_channel::Receiver;
use async_net::TcpStream;
use codee::{Decoder, Encoder};
use futures_lite::{AsyncRead, AsyncReadExt, AsyncWriteExt, future};
use slicelink_common::{
    BridgeMessage, NetworkPacket,
    codec::{LENGTH_PREFIX_BYTES, SliceLinkCodec, frame_length},
    error::BridgeError,
};
use tracing::{debug, error, info, trace, warn};

use crate::BridgeSettings;

#[derive(Default, Debug)]
/// Connects the outbound channel of a session to a front-end listening on TCP.
pub struct TcpTransport;

impl TcpTransport {
    /// Connects to `addr` and starts a thread forwarding `messages` to it.
    ///
    /// The thread runs until the session closes the channel. If the socket
    /// fails, the channel is closed so the session sees
    /// [`BridgeError::ChannelClosed`] on its next write.
    pub fn connect(
        addr: SocketAddr,
        messages: Receiver<BridgeMessage>,
        settings: &BridgeSettings,
    ) -> Result<TransportHandle, BridgeError> {
        info!("Connecting to front-end at {}", addr);
        let stream =
            future::block_on(TcpStream::connect(addr)).map_err(BridgeError::Connection)?;
        debug!("Connected to: {:?}", stream.peer_addr());

        let settings = settings.clone();
        let thread = std::thread::Builder::new()
            .name("slicelink-send".to_string())
            .spawn(move || future::block_on(send_loop(stream, messages, settings)))?;

        Ok(TransportHandle { thread })
    }
}

/// The running send thread of a [`TcpTransport`].
#[derive(Debug)]
pub struct TransportHandle {
    thread: JoinHandle<Result<usize, BridgeError>>,
}

impl TransportHandle {
    /// Waits for the send thread and returns how many messages it wrote.
    pub fn join(self) -> Result<usize, BridgeError> {
        self.thread.join().map_err(|_| {
            error!("Send thread panicked");
            BridgeError::ChannelClosed
        })?
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Encodes one message as a length-prefixed frame.
pub fn encode_frame(
    message: &BridgeMessage,
    max_packet_length: usize,
) -> Result<Vec<u8>, BridgeError> {
    let frame = SliceLinkCodec::encode(&message.to_packet()?)?;
    let len = frame.len() - LENGTH_PREFIX_BYTES;
    if len > max_packet_length {
        return Err(BridgeError::PacketTooLarge {
            len,
            max: max_packet_length,
        });
    }
    Ok(frame)
}

async fn send_loop(
    mut stream: TcpStream,
    messages: Receiver<BridgeMessage>,
    settings: BridgeSettings,
) -> Result<usize, BridgeError> {
    let mut written = 0;

    while let Ok(first_message) = messages.recv().await {
        // Whatever else is already queued goes out in the same write
        let mut batch = vec![first_message];
        while let Ok(message) = messages.try_recv() {
            batch.push(message);
        }
        let batch_size = batch.len();

        let capacity = messages.capacity().unwrap_or(settings.channel_capacity).max(1);
        let depth_percentage = messages.len() * 100 / capacity;
        if depth_percentage >= usize::from(settings.channel_warning_threshold) {
            warn!(
                "Channel depth at {}% ({}/{} messages) after taking a batch of {}",
                depth_percentage,
                messages.len(),
                capacity,
                batch_size
            );
        }

        let mut combined_buffer = Vec::new();
        for message in &batch {
            match encode_frame(message, settings.max_packet_length) {
                Ok(frame) => combined_buffer.extend_from_slice(&frame),
                Err(err) => {
                    error!("Could not encode {:?}: {}", message.job_id(), err);
                    messages.close();
                    return Err(err);
                }
            }
        }

        trace!("Sending {} bytes ({} messages)", combined_buffer.len(), batch_size);
        if let Err(err) = stream.write_all(&combined_buffer).await {
            error!("Could not send batch of {} messages: {}", batch_size, err);
            messages.close();
            return Err(err.into());
        }
        written += batch_size;
    }

    stream.flush().await?;
    stream.close().await?;
    debug!("Front-end stream closed after {} messages", written);
    Ok(written)
}

/// Reads one frame from a front-end side stream.
///
/// Returns `Ok(None)` once the stream has ended.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_packet_length: usize,
) -> Result<Option<NetworkPacket>, BridgeError> {
    let mut header = [0u8; LENGTH_PREFIX_BYTES];
    match reader.read_exact(&mut header).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let length = frame_length(header);
    if length > max_packet_length {
        error!("Received too large packet: {} > {}", length, max_packet_length);
        return Err(BridgeError::PacketTooLarge {
            len: length,
            max: max_packet_length,
        });
    }

    let mut frame = vec![0u8; LENGTH_PREFIX_BYTES + length];
    frame[..LENGTH_PREFIX_BYTES].copy_from_slice(&header);
    reader.read_exact(&mut frame[LENGTH_PREFIX_BYTES..]).await?;
    SliceLinkCodec::decode(&frame).map(Some)
}

/// [`read_packet`], decoded into a [`BridgeMessage`].
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_packet_length: usize,
) -> Result<Option<BridgeMessage>, BridgeError> {
    match read_packet(reader, max_packet_length).await? {
        Some(packet) => BridgeMessage::from_packet(&packet).map(Some),
        None => Ok(None),
    }
}

//! Shared mock-device harness for the session-engine integration tests.
//!
//! Plays the device side of the wire protocol directly against a real
//! `tokio::net::TcpListener`, using the crate's own codec/crypto so the
//! tests exercise genuine framing rather than a hand-rolled stand-in.

use byteorder::{BigEndian, WriteBytesExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tuya_lan::crypto::{TuyaCipher, prepare_key};
use tuya_lan::protocol::{self, PREFIX_55AA, TuyaHeader, TuyaMessage};

/// Reads complete frames off a `TcpStream`, buffering any bytes read
/// past a frame boundary for the next call.
pub struct FrameReader {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Reads and returns the next complete frame's raw bytes plus its
    /// parsed header. Blocks until one full frame has arrived.
    pub async fn next_frame(&mut self) -> (Vec<u8>, TuyaHeader) {
        loop {
            if let Ok(header) = protocol::parse_header(&self.buf)
                && self.buf.len() >= header.total_length as usize
            {
                let frame: Vec<u8> = self.buf.drain(..header.total_length as usize).collect();
                return (frame, header);
            }
            let mut tmp = [0u8; 4096];
            let n = self
                .stream
                .read(&mut tmp)
                .await
                .expect("mock device: socket read failed");
            assert!(n > 0, "mock device: peer closed before a full frame arrived");
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// True once a frame has been consumed and no further bytes have
    /// arrived yet — used to assert that request N+1 doesn't appear on
    /// the wire until this connection's caller has replied to request N.
    pub fn has_buffered_bytes(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Waits up to `dur` for any additional byte to arrive; returns
    /// `true` if one did (a serialization violation in the ordering
    /// test, since the client should still be awaiting this frame's
    /// response).
    pub async fn more_bytes_arrive_within(&mut self, dur: Duration) -> bool {
        if !self.buf.is_empty() {
            return true;
        }
        let mut probe = [0u8; 1];
        matches!(
            tokio::time::timeout(dur, self.stream.read(&mut probe)).await,
            Ok(Ok(n)) if n > 0
        )
    }

    pub async fn write_all(&mut self, data: &[u8]) {
        self.stream
            .write_all(data)
            .await
            .expect("mock device: socket write failed");
    }
}

/// Builds a 55AA response frame: `retcode` (4 bytes, big-endian) followed
/// by `body`, HMAC-trailered under `hmac_key` (pack_message's own CRC/HMAC
/// choice is keyed off `Some`/`None`, matching the codec's 3.4+ rule that
/// every such frame carries an HMAC rather than a CRC).
fn build_response(seqno: u32, cmd: u32, retcode: u32, body: &[u8], hmac_key: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + body.len());
    payload.write_u32::<BigEndian>(retcode).unwrap();
    payload.extend_from_slice(body);
    let msg = TuyaMessage {
        seqno,
        cmd,
        retcode: None,
        payload,
        prefix: PREFIX_55AA,
        iv: None,
    };
    protocol::pack_message(&msg, Some(hmac_key)).unwrap()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Plays the device side of the 3.4 session-key handshake over `reader`,
/// using `device_nonce` as this connection's nonce (tests pass distinct
/// nonces across reconnects to prove renegotiation actually happens).
/// Returns the derived session key, which must match what the client
/// computes on its end.
pub async fn negotiate_as_device(
    reader: &mut FrameReader,
    local_key: &[u8],
    device_nonce: [u8; 16],
) -> Vec<u8> {
    let key16 = prepare_key(local_key);
    let cipher = TuyaCipher::new(&key16).unwrap();

    // Step 1: client -> device, ECB-encrypted local nonce.
    let (raw, header) = reader.next_frame().await;
    let start = protocol::unpack_message(&raw, Some(local_key), Some(header), Some(true)).unwrap();
    assert_eq!(start.cmd, 0x03, "expected SessKeyNegStart");
    let local_nonce = cipher.decrypt(&start.payload, None, None).unwrap();
    assert_eq!(local_nonce.len(), 16);

    // Step 2: device -> client, device_nonce || HMAC(local_key, local_nonce).
    let proof = hmac_sha256(local_key, &local_nonce);
    let mut resp_plain = device_nonce.to_vec();
    resp_plain.extend_from_slice(&proof);
    let resp_cipher = cipher.encrypt(&resp_plain, None, None, true).unwrap();
    let resp_frame = build_response(start.seqno, 0x04, 0, &resp_cipher, local_key);
    reader.write_all(&resp_frame).await;

    // Step 3: client -> device, HMAC(local_key, device_nonce) finishing the
    // handshake. Verified here so a broken client fails loudly rather than
    // silently deriving a session key the device would never accept.
    let (raw, header) = reader.next_frame().await;
    let finish = protocol::unpack_message(&raw, Some(local_key), Some(header), Some(true)).unwrap();
    assert_eq!(finish.cmd, 0x05, "expected SessKeyNegFinish");
    let finish_hmac = cipher.decrypt(&finish.payload, None, None).unwrap();
    assert_eq!(finish_hmac, hmac_sha256(local_key, &device_nonce));

    let xored: Vec<u8> = local_nonce
        .iter()
        .zip(device_nonce.iter())
        .map(|(a, b)| a ^ b)
        .collect();
    cipher.encrypt(&xored, None, None, false).unwrap()
}

/// Reads one already-negotiated request frame, decrypts it with
/// `session_key`, and replies with `response_body` (compact JSON) under
/// the same session key. Returns the decrypted request body for
/// assertions.
pub async fn serve_one_request(
    reader: &mut FrameReader,
    session_key: &[u8],
    response_body: &[u8],
) -> Vec<u8> {
    let (raw, header) = reader.next_frame().await;
    let key16 = prepare_key(session_key);
    let cipher = TuyaCipher::new(&key16).unwrap();
    // Requests (app -> device) never carry the 4-byte retcode that
    // responses do; disable the codec's retcode parsing explicitly
    // rather than relying on auto-detection against ciphertext bytes.
    let msg = protocol::unpack_message(&raw, Some(session_key), Some(header), Some(true)).unwrap();
    let request_body = cipher.decrypt(&msg.payload, None, None).unwrap();

    let response_cipher = cipher.encrypt(response_body, None, None, true).unwrap();
    let response_frame = build_response(msg.seqno, msg.cmd, 0, &response_cipher, session_key);
    reader.write_all(&response_frame).await;
    request_body
}

//! Wire framing and the encryption handshake orchestration (§4.7.5, §8 scenario 5).
//!
//! Every frame on an upgraded session is `[type:u32-be][sequence:u32-be][length:u32-be][payload]`.
//! This module only frames and parses; it does not perform real cryptography (the
//! specification scopes this core to the handshake *state machine*, not a cipher suite),
//! so "ciphertext" here is a placeholder transform standing in for wherever a real TLS
//! implementation would plug in.

use std::io;

use super::state::{HandshakeEvent, HandshakeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    Hello = 0,
    Accept = 1,
    Data = 2,
    Goodbye = 3,
}

impl FrameType {
    fn from_u32(v: u32) -> Option<FrameType> {
        match v {
            0 => Some(FrameType::Hello),
            1 => Some(FrameType::Accept),
            2 => Some(FrameType::Data),
            3 => Some(FrameType::Goodbye),
            _ => None,
        }
    }
}

pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&(self.kind as u32).to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses one frame from the front of `buf`, returning the frame and the number of
    /// bytes consumed, or `None` if `buf` does not yet contain a whole frame.
    pub fn decode(buf: &[u8]) -> io::Result<Option<(Frame, usize)>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let sequence = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let length = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as usize;

        let kind = FrameType::from_u32(kind)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown frame type"))?;

        if buf.len() < HEADER_LEN + length {
            return Ok(None);
        }

        let payload = buf[HEADER_LEN..HEADER_LEN + length].to_vec();
        Ok(Some((Frame { kind, sequence, payload }, HEADER_LEN + length)))
    }
}

/// Drives one side of the handshake. `Handshake::client`/`Handshake::server` pick which
/// side of the hello/accept exchange this session plays.
pub struct Handshake {
    state: HandshakeState,
    is_client: bool,
    next_sequence: u32,
    /// Set once this side has sent (or echoed) a `Goodbye`; distinguishes "I sent the
    /// first goodbye, waiting for the peer's reply" from "I'm replying to the peer's
    /// goodbye" without adding downgrade states to `HandshakeState` itself (§4.7.5
    /// treats downgrade as orthogonal follow-up to an already-`Established` handshake,
    /// not a new state in the handshake FSM proper).
    downgrade_sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Send this frame to the peer.
    Send(FrameType),
    /// Nothing to send; waiting on the peer.
    Wait,
    /// The handshake is established; plaintext may now be sent/received as `Data`
    /// frames.
    Established,
    /// Both sides have exchanged `Goodbye`; the session may restore plaintext mode.
    Downgraded,
}

impl Handshake {
    pub fn client() -> Handshake {
        Handshake { state: HandshakeState::Default, is_client: true, next_sequence: 0, downgrade_sent: false }
    }

    pub fn server() -> Handshake {
        Handshake { state: HandshakeState::Default, is_client: false, next_sequence: 0, downgrade_sent: false }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn alloc_sequence(&mut self) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Called once to kick off a client-side handshake; produces the `Hello` frame to
    /// send. Servers wait passively for an incoming `Hello` instead.
    pub fn start(&mut self) -> Option<Frame> {
        if !self.is_client {
            return None;
        }
        self.state = self.state.next(HandshakeEvent::SendHello)?;
        Some(Frame { kind: FrameType::Hello, sequence: self.alloc_sequence(), payload: Vec::new() })
    }

    /// Initiates downgrade (§4.7.5 "Downgrade issues a protocol-level goodbye"):
    /// produces the `Goodbye` frame to send. Only valid once `Established`.
    pub fn begin_downgrade(&mut self) -> io::Result<Frame> {
        if self.state != HandshakeState::Established {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "handshake not established"));
        }
        self.downgrade_sent = true;
        Ok(Frame { kind: FrameType::Goodbye, sequence: self.alloc_sequence(), payload: Vec::new() })
    }

    /// Feeds an incoming handshake frame, returning the frame to send in response (if
    /// any) and whether the handshake is now established.
    pub fn on_frame(&mut self, frame: &Frame) -> io::Result<HandshakeAction> {
        if frame.kind == FrameType::Goodbye {
            if self.state != HandshakeState::Established {
                self.state = HandshakeState::Failed;
                return Err(io::Error::new(io::ErrorKind::InvalidData, "goodbye before handshake established"));
            }
            // Whichever side sent first is already `downgrade_sent`; seeing the peer's
            // goodbye now is the acknowledgment. Whichever side receives first echoes
            // its own goodbye back before declaring itself downgraded.
            if self.downgrade_sent {
                return Ok(HandshakeAction::Downgraded);
            }
            self.downgrade_sent = true;
            return Ok(HandshakeAction::Send(FrameType::Goodbye));
        }

        let event = match (self.is_client, frame.kind) {
            (false, FrameType::Hello) => HandshakeEvent::RecvHello,
            (true, FrameType::Accept) => HandshakeEvent::RecvAccept,
            (_, FrameType::Data) => {
                return if self.state == HandshakeState::Established {
                    Ok(HandshakeAction::Established)
                } else {
                    Err(io::Error::new(io::ErrorKind::InvalidData, "data frame before handshake established"))
                };
            }
            _ => {
                self.state = HandshakeState::Failed;
                return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected frame for handshake role"));
            }
        };

        self.state = self.state.next(event).ok_or_else(|| {
            self.state = HandshakeState::Failed;
            io::Error::new(io::ErrorKind::InvalidData, "invalid handshake transition")
        })?;

        match self.state {
            HandshakeState::HelloReceived => {
                self.state = self.state.next(HandshakeEvent::SendAccept).unwrap();
                Ok(HandshakeAction::Send(FrameType::Accept))
            }
            HandshakeState::AcceptReceived | HandshakeState::AcceptSent => {
                self.state = self.state.next(HandshakeEvent::Finish).unwrap();
                Ok(HandshakeAction::Established)
            }
            _ => Ok(HandshakeAction::Wait),
        }
    }

    pub fn next_data_frame(&mut self, payload: Vec<u8>) -> io::Result<Frame> {
        if self.state != HandshakeState::Established {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "handshake not established"));
        }
        Ok(Frame { kind: FrameType::Data, sequence: self.alloc_sequence(), payload })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_roundtrips_through_encode_decode() {
        let frame = Frame { kind: FrameType::Data, sequence: 7, payload: b"hello".to_vec() };
        let encoded = frame.encode();
        let (decoded, consumed) = Frame::decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_reports_incomplete_frame_as_none() {
        let frame = Frame { kind: FrameType::Hello, sequence: 0, payload: b"xyz".to_vec() };
        let encoded = frame.encode();
        let partial = &encoded[..encoded.len() - 1];
        assert!(Frame::decode(partial).unwrap().is_none());
    }

    #[test]
    fn client_and_server_handshake_reach_established() {
        let mut client = Handshake::client();
        let mut server = Handshake::server();

        let hello = client.start().unwrap();
        let action = server.on_frame(&hello).unwrap();
        let accept = match action {
            HandshakeAction::Send(FrameType::Accept) => {
                Frame { kind: FrameType::Accept, sequence: 0, payload: Vec::new() }
            }
            other => panic!("expected accept frame, got {:?}", other),
        };
        assert_eq!(server.state(), HandshakeState::Established);

        let action = client.on_frame(&accept).unwrap();
        assert_eq!(action, HandshakeAction::Established);
        assert_eq!(client.state(), HandshakeState::Established);

        let data = client.next_data_frame(b"payload".to_vec()).unwrap();
        assert_eq!(server.on_frame(&data).unwrap(), HandshakeAction::Established);
    }

    fn established_pair() -> (Handshake, Handshake) {
        let mut client = Handshake::client();
        let mut server = Handshake::server();
        let hello = client.start().unwrap();
        let accept = match server.on_frame(&hello).unwrap() {
            HandshakeAction::Send(FrameType::Accept) => Frame { kind: FrameType::Accept, sequence: 0, payload: Vec::new() },
            other => panic!("expected accept frame, got {:?}", other),
        };
        assert_eq!(client.on_frame(&accept).unwrap(), HandshakeAction::Established);
        (client, server)
    }

    #[test]
    fn downgrade_completes_on_both_sides_after_goodbye_exchange() {
        let (mut client, mut server) = established_pair();

        let goodbye = client.begin_downgrade().unwrap();
        let echo = match server.on_frame(&goodbye).unwrap() {
            HandshakeAction::Send(FrameType::Goodbye) => {
                Frame { kind: FrameType::Goodbye, sequence: 0, payload: Vec::new() }
            }
            other => panic!("expected server to echo goodbye, got {:?}", other),
        };

        assert_eq!(client.on_frame(&echo).unwrap(), HandshakeAction::Downgraded);
    }

    #[test]
    fn goodbye_before_established_is_rejected() {
        let mut server = Handshake::server();
        let goodbye = Frame { kind: FrameType::Goodbye, sequence: 0, payload: Vec::new() };
        assert!(server.on_frame(&goodbye).is_err());
    }
}

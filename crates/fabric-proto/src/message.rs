use bytes::Bytes;

use crate::ProtoError;

/// Stable u16 codes for every message type in the fabric. These are wire
/// constants: changing a value is a breaking protocol change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Disconnect = 1,
    Greeting = 2,
    GreetingReply = 3,

    SetupProvider = 10,
    SpawnKernel = 11,
    SpawnKernelReply = 12,

    ReqKernel = 20,
    ResKernel = 21,

    ReadyKernel = 30,

    ReqFileServing = 40,
    ResFileServing = 41,
    StreamFile = 42,
    FetchFile = 43,

    ReqClearWorkspace = 50,
    ResClearWorkspace = 51,
}

impl MessageType {
    pub fn pack(self) -> Bytes {
        Bytes::copy_from_slice(&(self as u16).to_le_bytes())
    }

    pub fn unpack(frame: &[u8]) -> Result<Self, ProtoError> {
        if frame.len() != 2 {
            return Err(ProtoError::Truncated);
        }
        let code = u16::from_le_bytes([frame[0], frame[1]]);
        Self::try_from(code)
    }
}

impl TryFrom<u16> for MessageType {
    type Error = ProtoError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        use MessageType::*;
        Ok(match code {
            1 => Disconnect,
            2 => Greeting,
            3 => GreetingReply,
            10 => SetupProvider,
            11 => SpawnKernel,
            12 => SpawnKernelReply,
            20 => ReqKernel,
            21 => ResKernel,
            30 => ReadyKernel,
            40 => ReqFileServing,
            41 => ResFileServing,
            42 => StreamFile,
            43 => FetchFile,
            50 => ReqClearWorkspace,
            51 => ResClearWorkspace,
            other => return Err(ProtoError::UnknownMessageType(other)),
        })
    }
}

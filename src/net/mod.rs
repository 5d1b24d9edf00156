//! Wire protocol shared by the client and the broker.
//!
//! Every frame is `[u32 length][u8 frame_type][u64 correlation_id][payload]`,
//! big-endian. Requests carry a fresh correlation id and the broker echoes it
//! in the response; frames pushed by the broker (`Message`) use 0.

pub mod frame;

pub use frame::{
    code, encode_frame, try_decode_frame, AckPayload, ConnectPayload, ConnectedPayload,
    ErrorPayload, FlowPayload, Frame, FrameDecodeError, FrameEncodeError, FrameType, IdPayload,
    MessageMetadata, MessagePayload, ProducerPayload, ProducerSuccessPayload, SendPayload,
    SendReceiptPayload, SubscribePayload, MAX_FRAME_SIZE, MAX_MESSAGE_SIZE, MAX_PAYLOAD_LEN,
    PROTOCOL_VERSION,
};

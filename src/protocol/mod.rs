//! # Relay Protocol
//!
//! The vocabulary shared by broker and managed client:
//!
//! ```text
//! protocol/
//! ├── topic.rs    - topic name / filter validation and wildcard matching
//! ├── message.rs  - ApplicationMessage and QoS
//! ├── frame.rs    - session-level frames (CONNECT, PUBLISH, SUBSCRIBE, ...)
//! └── codec.rs    - length-delimited JSON framing for any byte stream
//! ```
//!
//! The frame set mirrors MQTT's control packets closely enough to express the
//! connection lifecycle, but it is not the MQTT binary encoding.

pub mod codec;
pub mod frame;
pub mod message;
pub mod topic;

pub use codec::{FrameCodec, ProtocolError, Transport, DEFAULT_MAX_FRAME_SIZE};
pub use frame::Frame;
pub use message::{ApplicationMessage, QoS};
pub use topic::{topic_matches, validate_topic_filter, validate_topic_name, TopicError};

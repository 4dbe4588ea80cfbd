//! WebSocket signaling relay for one-to-one WebRTC calls
//!
//! Browser clients connect over a WebSocket, get paired with an idle peer,
//! and exchange session descriptions and ICE candidates through the relay
//! until their direct media path is up. The relay never inspects those
//! payloads and never carries media.
//!
//! # Protocol
//!
//! - **GET /ws** - WebSocket signaling endpoint
//! - **GET /health** - Health check
//! - **GET /** - Static browser client
//!
//! Every frame is a JSON object with a `type` field.
//!
//! ## Client → relay
//!
//! - `{"type":"register"}`
//! - `{"type":"initiate_call","data":"<offer>","targetPeer":"<uuid>"?}`
//! - `{"type":"accept_call","callId":"<uuid>","data":"<answer>"}`
//! - `{"type":"reject_call","callId":"<uuid>","reason":"..."?}`
//! - `{"type":"ice-candidate","callId":"<uuid>","data":"<candidate>"}`
//! - `{"type":"offer"|"answer","callId":"<uuid>","data":"..."}` - renegotiation
//! - `{"type":"hangup","callId":"<uuid>"?,"reason":"..."?}`
//! - `{"type":"ping"}`
//!
//! ## Relay → client
//!
//! - `register_success`, `call_initiated`, `incoming_call`, `answer`, `offer`,
//!   `call_rejected`, `ice-candidate`, `peer_disconnected`, `pong`
//! - `{"type":"peer_list","peers":[{"id":"<uuid>","status":"idle"}]}` after
//!   every state change
//! - `{"type":"error","reason":"...","callId":"<uuid>"?}`
//!
//! # Example
//!
//! ```bash
//! callrelay-signaling --port 8000 --static-dir ./client
//! websocat ws://127.0.0.1:8000/ws
//! {"type":"register"}
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod liveness;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod state;

pub use config::Config;
pub use error::{ClientRequestError, SignalingError};
pub use handler::MessageRouter;
pub use protocol::{CallId, CallStatus, ClientMessage, PeerId, ServerMessage};
pub use server::{AppState, build_router, serve};
pub use state::{ClientRegistry, RoomRegistry, ServerState};

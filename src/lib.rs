/*!
# capchat

A federated peer-to-peer chat fabric. End users exchange authenticated text
messages across a mesh of independent relay nodes ("CAPs"): each CAP accepts
WebSocket connections from its clients, routes messages locally when both
parties are attached, and fans out over a durable pub/sub bus otherwise.
Clients prove authorship with per-recipient recoverable signatures and defeat
replay with strictly monotonic nonces.

The `networking` tree is the CAP side; the `client` tree is the session core
a frontend embeds.
*/

pub mod address;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keypair;
pub mod networking;
pub mod test_utilities;

pub use error::{Error, Result};

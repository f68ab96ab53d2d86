//! Wire protocol between the client and the remote service.
//!
//! Control messages travel as JSON text frames. Console and file data
//! travel as binary frames carrying UTF-8 text.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::channel::RemoteSession;

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a session; sent once, right after the websocket handshake.
    Connect {
        problem: String,
        service: String,
        args: Vec<String>,
        tty: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Initial file bundle, name to base64 content.
        files: BTreeMap<String, String>,
    },
}

impl ClientMessage {
    /// Build the opening message for `session`.
    #[must_use]
    pub fn connect(session: &RemoteSession) -> Self {
        Self::Connect {
            problem: session.problem.clone(),
            service: session.service.clone(),
            args: session.args.clone(),
            tty: session.tty,
            token: session.token.clone(),
            files: session
                .files
                .iter()
                .map(|(name, content)| (name.clone(), BASE64.encode(content)))
                .collect(),
        }
    }

    /// Decode the file bundle of a `Connect` message.
    ///
    /// Entries that are not valid base64 are skipped.
    #[must_use]
    pub fn decode_files(&self) -> BTreeMap<String, Vec<u8>> {
        let Self::Connect { files, .. } = self;
        files
            .iter()
            .filter_map(|(name, data)| BASE64.decode(data).ok().map(|bytes| (name.clone(), bytes)))
            .collect()
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake completed.
    ConnectBegin {
        #[serde(default)]
        message: Vec<String>,
    },
    /// Following data frames are the content of `name`.
    BinaryDataHeader {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    /// The service finished; a non-empty first line lists output files.
    ConnectStop {
        #[serde(default)]
        message: Vec<String>,
    },
    /// The service rejected or aborted the session.
    Error { message: String },
}

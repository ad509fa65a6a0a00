use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_X: f64 = 100.0;
pub const DEFAULT_Y: f64 = 100.0;
pub const DEFAULT_DIRECTION: f64 = 0.0;

pub const WORLD_WIDTH: f64 = 800.0;
pub const WORLD_HEIGHT: f64 = 600.0;
pub const PLAYER_SPEED: f64 = 5.0;

/// Headings a keyboard-driven client reports: right, up, left, down.
pub const DIRECTIONS: [f64; 4] = [0.0, 90.0, 180.0, 270.0];

/// Server-issued identity of one live connection.
///
/// Encoded on the wire as the decimal string key of the snapshot map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last known position and heading of a client. `direction` is in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub x: f64,
    pub y: f64,
    pub direction: f64,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            x: DEFAULT_X,
            y: DEFAULT_Y,
            direction: DEFAULT_DIRECTION,
        }
    }
}

impl ClientState {
    pub fn new(x: f64, y: f64, direction: f64) -> Self {
        Self { x, y, direction }
    }

    /// Overwrites the fields present in `update`, keeping the rest.
    pub fn apply(&mut self, update: &StateUpdate) {
        if let Some(x) = update.x {
            self.x = x;
        }
        if let Some(y) = update.y {
            self.y = y;
        }
        if let Some(direction) = update.direction {
            self.direction = direction;
        }
    }
}

/// Client-to-server message. Every field is optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<f64>,
}

impl StateUpdate {
    /// Decodes a JSON object. Arrays and scalars are rejected even though
    /// serde would map a sequence onto the struct fields positionally.
    ///
    /// Fields must be finite: JSON has no spelling for infinity, so a stored
    /// infinite value would encode as `null` in every later snapshot.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
        let update: Self = serde_json::from_value(serde_json::Value::Object(object))?;

        for (name, value) in update.fields() {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(serde::de::Error::custom(format!(
                    "field `{}` is not a finite number",
                    name
                )));
            }
        }

        Ok(update)
    }

    fn fields(&self) -> [(&'static str, Option<f64>); 3] {
        [("x", self.x), ("y", self.y), ("direction", self.direction)]
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ClientState> for StateUpdate {
    fn from(state: ClientState) -> Self {
        Self {
            x: Some(state.x),
            y: Some(state.y),
            direction: Some(state.direction),
        }
    }
}

/// Every known client state at one instant.
///
/// Built by copying out of the server's store and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot {
    clients: BTreeMap<ClientId, ClientState>,
}

impl StateSnapshot {
    pub fn get(&self, id: ClientId) -> Option<&ClientState> {
        self.clients.get(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &ClientState)> {
        self.clients.iter().map(|(id, state)| (*id, state))
    }

    pub fn ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.keys().copied()
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl FromIterator<(ClientId, ClientState)> for StateSnapshot {
    fn from_iter<I: IntoIterator<Item = (ClientId, ClientState)>>(iter: I) -> Self {
        Self {
            clients: iter.into_iter().collect(),
        }
    }
}

//! Verbindungs-Zustandsmaschine
//!
//! Reine Funktion (Zustand, Kanal-Event) -> (neuer Zustand, Effekte). Der
//! ConnectionManager führt die Effekte aus; hier passiert keine I/O.

use super::client::ConnectionError;

/// Normal Closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Going Away (z.B. Server-Neustart)
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close-Frame ohne Status-Code
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Verbindung ohne Close-Frame abgebrochen
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Aktueller Status der Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle- und Nachrichten-Events des Kanals
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Binary(Vec<u8>),
    Text(String),
    Closed { code: u16, reason: String },
    Error(String),
}

/// Vom Manager auszuführende Effekte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    SurfaceError(ConnectionError),
    CloseChannel,
    DeliverAudio(Vec<u8>),
    DeliverControl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnectionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: ConnectionState) -> Self {
        Self {
            next: state,
            effects: Vec::new(),
        }
    }
}

/// Sauberer/erwarteter Verbindungsabbau?
pub fn is_clean_close(code: u16) -> bool {
    matches!(code, CLOSE_NORMAL | CLOSE_GOING_AWAY | CLOSE_NO_STATUS)
}

/// Berechnet den Folgezustand für ein Kanal-Event
///
/// Events im Zustand `Disconnected` stammen von einem bereits abgebauten
/// Kanal und werden ignoriert. Dadurch wird ein Fehler pro Kanal genau
/// einmal gemeldet, auch wenn auf das Error-Event noch ein Close folgt.
pub fn transition(state: ConnectionState, event: ChannelEvent, endpoint: &str) -> Transition {
    use ConnectionState::*;

    match (state, event) {
        (Disconnected, _) => Transition::stay(Disconnected),

        (Connecting | Connected, ChannelEvent::Opened) => Transition::stay(Connected),

        (Connected, ChannelEvent::Binary(data)) => Transition {
            next: Connected,
            effects: vec![Effect::DeliverAudio(data)],
        },

        (Connected, ChannelEvent::Text(text)) => Transition {
            next: Connected,
            effects: vec![Effect::DeliverControl(text)],
        },

        // Vor dem Open kann eigentlich nichts ankommen
        (Connecting, ChannelEvent::Binary(_) | ChannelEvent::Text(_)) => {
            Transition::stay(Connecting)
        }

        (Connecting | Connected, ChannelEvent::Closed { code, .. }) if is_clean_close(code) => {
            Transition::stay(Disconnected)
        }

        (Connecting | Connected, ChannelEvent::Closed { code, reason }) => Transition {
            next: Disconnected,
            effects: vec![Effect::SurfaceError(ConnectionError::UnexpectedClose {
                endpoint: endpoint.to_string(),
                code,
                reason,
            })],
        },

        (Connecting | Connected, ChannelEvent::Error(reason)) => Transition {
            next: Disconnected,
            effects: vec![
                Effect::SurfaceError(ConnectionError::Unreachable {
                    endpoint: endpoint.to_string(),
                    reason,
                }),
                Effect::CloseChannel,
            ],
        },
    }
}

use std::collections::BTreeMap;
use std::time::Instant;

use serde_json::Value;

use crate::common::{ChannelId, Error, Result, SessionId, VoiceServerInfo};
use crate::protocol::{OutgoingMessage, PlayerUpdateState, TrackEndReason, VoiceUpdateEvent};

/// Where a player is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerPhase {
    /// No voice connection and none requested.
    Idle,
    /// Caller asked to connect; waiting for the platform's voice
    /// credentials to complete.
    AwaitingVoiceServer,
    /// voiceUpdate sent to the node; waiting for its acknowledgment.
    ConnectingVoice,
    Ready(Playback),
    /// Explicit teardown; terminal.
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playback {
    Stopped,
    Playing,
    Paused,
}

impl PlayerPhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingVoiceServer => "awaiting-voice-server",
            Self::ConnectingVoice => "connecting-voice",
            Self::Ready(Playback::Stopped) => "stopped",
            Self::Ready(Playback::Playing) => "playing",
            Self::Ready(Playback::Paused) => "paused",
            Self::Destroyed => "destroyed",
        }
    }

    fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Options for a play command.
#[derive(Debug, Clone)]
pub struct PlayOptions {
    /// Encoded track blob. Opaque to the player.
    pub track: String,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
    pub paused: bool,
    /// When false, a track already loaded on the node wins and this play
    /// becomes a no-op on the node side.
    pub replace: bool,
}

impl PlayOptions {
    pub fn new(track: impl Into<String>) -> Self {
        Self {
            track: track.into(),
            start_ms: None,
            end_ms: None,
            paused: false,
            replace: true,
        }
    }
}

/// Side effects a transition asks its driver to perform. The machine
/// itself never touches a socket.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Queue a command frame on the bound node.
    Send(OutgoingMessage),
    /// Ask the voice gateway to join a channel.
    JoinChannel(ChannelId),
    /// Ask the voice gateway to leave the session's channel.
    LeaveChannel(ChannelId),
}

/// Logical player state carried across a node failover.
#[derive(Debug, Clone, Default)]
pub struct PlayerSnapshot {
    pub track: Option<String>,
    pub position_ms: u64,
    pub paused: bool,
    pub volume: u16,
    pub filters: Value,
}

/// The per-session player state machine. Pure: every input returns the
/// effects to run, and the single-writer invariant is the driver's job
/// (one mailbox task per session).
pub struct PlayerMachine {
    session_id: SessionId,
    phase: PlayerPhase,
    channel: Option<ChannelId>,
    voice: VoiceServerInfo,
    track: Option<String>,
    position_ms: u64,
    last_update: Option<Instant>,
    paused: bool,
    volume: u16,
    filters: BTreeMap<String, Value>,
    /// At most one queued connect-completion action.
    pending_play: Option<PlayOptions>,
}

impl PlayerMachine {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            phase: PlayerPhase::Idle,
            channel: None,
            voice: VoiceServerInfo::default(),
            track: None,
            position_ms: 0,
            last_update: None,
            paused: false,
            volume: 100,
            filters: BTreeMap::new(),
            pending_play: None,
        }
    }

    pub fn phase(&self) -> PlayerPhase {
        self.phase
    }

    pub fn current_track(&self) -> Option<&str> {
        self.track.as_deref()
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// Current position, extrapolated from the last node report while
    /// playing.
    pub fn position_ms(&self) -> u64 {
        match (self.phase, self.last_update) {
            (PlayerPhase::Ready(Playback::Playing), Some(at)) => {
                self.position_ms + at.elapsed().as_millis() as u64
            }
            _ => self.position_ms,
        }
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            track: self.track.clone(),
            position_ms: self.position_ms(),
            paused: self.paused,
            volume: self.volume,
            filters: self.merged_filters(),
        }
    }

    // ---- caller commands -------------------------------------------------

    pub fn request_connect(&mut self, channel: ChannelId) -> Result<Vec<Effect>> {
        self.guard_alive()?;
        self.channel = Some(channel);
        if self.phase == PlayerPhase::Idle {
            self.phase = PlayerPhase::AwaitingVoiceServer;
        }
        Ok(vec![Effect::JoinChannel(channel)])
    }

    pub fn play(&mut self, opts: PlayOptions) -> Result<Vec<Effect>> {
        self.guard_alive()?;
        match self.phase {
            PlayerPhase::Ready(_) => Ok(vec![self.start_play(opts)]),
            // Connect is imminent; hold exactly one pending action. A
            // second play replaces the first, mirroring the node's
            // replaced semantics.
            PlayerPhase::AwaitingVoiceServer | PlayerPhase::ConnectingVoice => {
                self.pending_play = Some(opts);
                Ok(Vec::new())
            }
            PlayerPhase::Idle => Err(Error::PlayerNotReady),
            PlayerPhase::Destroyed => Err(Error::PlayerDestroyed),
        }
    }

    pub fn pause(&mut self) -> Result<Vec<Effect>> {
        self.set_paused(true)
    }

    pub fn resume(&mut self) -> Result<Vec<Effect>> {
        self.set_paused(false)
    }

    fn set_paused(&mut self, pause: bool) -> Result<Vec<Effect>> {
        self.guard_alive()?;
        match self.phase {
            PlayerPhase::Ready(Playback::Playing) | PlayerPhase::Ready(Playback::Paused) => {
                // Fold extrapolated progress in before the clock stops.
                self.position_ms = self.position_ms();
                self.last_update = Some(Instant::now());
                self.paused = pause;
                self.phase = PlayerPhase::Ready(if pause {
                    Playback::Paused
                } else {
                    Playback::Playing
                });
                Ok(vec![Effect::Send(OutgoingMessage::Pause {
                    guild_id: self.session_id.clone(),
                    pause,
                })])
            }
            PlayerPhase::Ready(Playback::Stopped) => Err(Error::InvalidPlayerState {
                state: self.phase.name(),
            }),
            _ => Err(Error::PlayerNotReady),
        }
    }

    pub fn stop(&mut self) -> Result<Vec<Effect>> {
        self.guard_alive()?;
        if !self.phase.is_ready() {
            return Err(Error::PlayerNotReady);
        }
        self.track = None;
        self.position_ms = 0;
        self.last_update = None;
        self.phase = PlayerPhase::Ready(Playback::Stopped);
        Ok(vec![Effect::Send(OutgoingMessage::Stop {
            guild_id: self.session_id.clone(),
        })])
    }

    pub fn seek(&mut self, position_ms: u64) -> Result<Vec<Effect>> {
        self.guard_alive()?;
        match self.phase {
            PlayerPhase::Ready(Playback::Playing) | PlayerPhase::Ready(Playback::Paused) => {
                self.position_ms = position_ms;
                self.last_update = Some(Instant::now());
                Ok(vec![Effect::Send(OutgoingMessage::Seek {
                    guild_id: self.session_id.clone(),
                    position: position_ms,
                })])
            }
            _ => Err(Error::InvalidPlayerState {
                state: self.phase.name(),
            }),
        }
    }

    pub fn set_volume(&mut self, volume: u16) -> Result<Vec<Effect>> {
        self.guard_alive()?;
        if !self.phase.is_ready() {
            return Err(Error::PlayerNotReady);
        }
        self.volume = volume;
        Ok(vec![Effect::Send(OutgoingMessage::Volume {
            guild_id: self.session_id.clone(),
            volume,
        })])
    }

    pub fn set_filter(&mut self, label: impl Into<String>, value: Value) -> Result<Vec<Effect>> {
        self.guard_alive()?;
        if !self.phase.is_ready() {
            return Err(Error::PlayerNotReady);
        }
        self.filters.insert(label.into(), value);
        Ok(vec![self.filters_effect()])
    }

    pub fn remove_filter(&mut self, label: &str) -> Result<Vec<Effect>> {
        self.guard_alive()?;
        if !self.phase.is_ready() {
            return Err(Error::PlayerNotReady);
        }
        self.filters.remove(label);
        Ok(vec![self.filters_effect()])
    }

    pub fn clear_filters(&mut self) -> Result<Vec<Effect>> {
        self.guard_alive()?;
        if !self.phase.is_ready() {
            return Err(Error::PlayerNotReady);
        }
        self.filters.clear();
        Ok(vec![self.filters_effect()])
    }

    /// Teardown from any state. Idempotent.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        if self.phase == PlayerPhase::Destroyed {
            return Vec::new();
        }
        let mut effects = vec![Effect::Send(OutgoingMessage::Destroy {
            guild_id: self.session_id.clone(),
        })];
        if let Some(channel) = self.channel.take() {
            effects.push(Effect::LeaveChannel(channel));
        }
        self.phase = PlayerPhase::Destroyed;
        self.pending_play = None;
        self.track = None;
        effects
    }

    // ---- voice-gateway inputs -------------------------------------------

    pub fn on_voice_state_update(&mut self, voice_session_id: String) -> Vec<Effect> {
        if self.phase == PlayerPhase::Destroyed {
            return Vec::new();
        }
        self.voice.voice_session_id = Some(voice_session_id);
        self.maybe_send_voice_update()
    }

    pub fn on_voice_server_update(&mut self, token: String, endpoint: String) -> Vec<Effect> {
        if self.phase == PlayerPhase::Destroyed {
            return Vec::new();
        }
        self.voice.token = Some(token);
        self.voice.endpoint = Some(endpoint);
        self.maybe_send_voice_update()
    }

    fn maybe_send_voice_update(&mut self) -> Vec<Effect> {
        if !self.voice.is_complete() {
            return Vec::new();
        }
        if self.phase == PlayerPhase::AwaitingVoiceServer {
            self.phase = PlayerPhase::ConnectingVoice;
        }
        match self.voice_update_message() {
            Some(msg) => vec![Effect::Send(msg)],
            None => Vec::new(),
        }
    }

    fn voice_update_message(&self) -> Option<OutgoingMessage> {
        Some(OutgoingMessage::VoiceUpdate {
            guild_id: self.session_id.clone(),
            session_id: self.voice.voice_session_id.clone()?,
            event: VoiceUpdateEvent {
                token: self.voice.token.clone()?,
                endpoint: self.voice.endpoint.clone()?,
            },
        })
    }

    // ---- node inputs -----------------------------------------------------

    /// Periodic state sync from the node; doubles as the voice-connect
    /// acknowledgment.
    pub fn on_player_update(&mut self, state: PlayerUpdateState) -> Vec<Effect> {
        if self.phase == PlayerPhase::Destroyed {
            return Vec::new();
        }
        if let Some(position) = state.position {
            self.position_ms = position;
            self.last_update = Some(Instant::now());
        }

        if state.connected {
            if self.phase == PlayerPhase::ConnectingVoice {
                // Node acknowledged the voice connection; release the one
                // queued action, or settle into Stopped.
                match self.pending_play.take() {
                    Some(opts) => {
                        let effect = self.start_play(opts);
                        return vec![effect];
                    }
                    None => self.phase = PlayerPhase::Ready(Playback::Stopped),
                }
            }
        } else if self.phase.is_ready() {
            // Voice dropped under us; a playing track cannot outlive
            // voice readiness. Park the track so the next ack replays it
            // at the position the clock had reached.
            self.position_ms = self.position_ms();
            self.last_update = None;
            if let Some(track) = self.track.take() {
                self.pending_play = Some(PlayOptions {
                    track,
                    start_ms: Some(self.position_ms),
                    end_ms: None,
                    paused: self.paused,
                    replace: true,
                });
            }
            self.phase = PlayerPhase::ConnectingVoice;
        }
        Vec::new()
    }

    pub fn on_track_start(&mut self, track: String) -> Vec<Effect> {
        if self.phase == PlayerPhase::Destroyed {
            return Vec::new();
        }
        self.track = Some(track);
        self.last_update = Some(Instant::now());
        if self.phase.is_ready() || self.phase == PlayerPhase::ConnectingVoice {
            self.phase = PlayerPhase::Ready(if self.paused {
                Playback::Paused
            } else {
                Playback::Playing
            });
        }
        Vec::new()
    }

    pub fn on_track_end(&mut self, reason: TrackEndReason) -> Vec<Effect> {
        if self.phase == PlayerPhase::Destroyed {
            return Vec::new();
        }
        match reason {
            // The caller already started another track; the node reports
            // the old one ending. No state change.
            TrackEndReason::Replaced => {}
            TrackEndReason::Finished
            | TrackEndReason::Stopped
            | TrackEndReason::Cleanup
            | TrackEndReason::LoadFailed => {
                self.track = None;
                self.position_ms = 0;
                self.last_update = None;
                if self.phase.is_ready() {
                    self.phase = PlayerPhase::Ready(Playback::Stopped);
                }
            }
        }
        Vec::new()
    }

    // ---- failover / rehydration -----------------------------------------

    /// Re-issues voice and playback state. Used both after the bound node
    /// reconnects (the node does not persist players across transport
    /// drops) and after re-binding to a replacement node. Logical state
    /// survives; the physical connection does not.
    pub fn resync(&mut self) -> Vec<Effect> {
        if self.phase == PlayerPhase::Destroyed || self.phase == PlayerPhase::Idle {
            return Vec::new();
        }

        if let Some(track) = self.track.take() {
            self.pending_play = Some(PlayOptions {
                track,
                start_ms: Some(self.position_ms()),
                end_ms: None,
                paused: self.paused,
                replace: true,
            });
        }

        self.phase = if self.voice.is_complete() {
            PlayerPhase::ConnectingVoice
        } else {
            PlayerPhase::AwaitingVoiceServer
        };

        match self.voice_update_message() {
            Some(msg) => vec![Effect::Send(msg)],
            None => Vec::new(),
        }
    }

    /// Restores logical state from a snapshot taken on another player
    /// instance, then behaves like [`resync`](Self::resync) once voice
    /// credentials arrive.
    pub fn restore(&mut self, snapshot: PlayerSnapshot) {
        if self.phase == PlayerPhase::Destroyed {
            return;
        }
        self.paused = snapshot.paused;
        self.volume = snapshot.volume;
        if let Value::Object(map) = snapshot.filters {
            self.filters = map.into_iter().collect();
        }
        if let Some(track) = snapshot.track {
            self.pending_play = Some(PlayOptions {
                track,
                start_ms: Some(snapshot.position_ms),
                end_ms: None,
                paused: snapshot.paused,
                replace: true,
            });
        }
    }

    // ---- helpers ---------------------------------------------------------

    fn start_play(&mut self, opts: PlayOptions) -> Effect {
        self.track = Some(opts.track.clone());
        self.paused = opts.paused;
        self.position_ms = opts.start_ms.unwrap_or(0);
        self.last_update = Some(Instant::now());
        self.phase = PlayerPhase::Ready(if opts.paused {
            Playback::Paused
        } else {
            Playback::Playing
        });
        Effect::Send(OutgoingMessage::Play {
            guild_id: self.session_id.clone(),
            track: opts.track,
            start_time: opts.start_ms,
            end_time: opts.end_ms,
            volume: Some(self.volume),
            no_replace: Some(!opts.replace),
            pause: opts.paused.then_some(true),
        })
    }

    fn filters_effect(&self) -> Effect {
        Effect::Send(OutgoingMessage::Filters {
            guild_id: self.session_id.clone(),
            filters: self.merged_filters(),
        })
    }

    fn merged_filters(&self) -> Value {
        Value::Object(
            self.filters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn guard_alive(&self) -> Result<()> {
        if self.phase == PlayerPhase::Destroyed {
            return Err(Error::PlayerDestroyed);
        }
        Ok(())
    }
}

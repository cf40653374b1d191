//! Cross-stream frame synchronization.
//!
//! A [`SyncedGroupHolder`] replaces the per-stream holders of a fixed set of
//! member streams so that readers of every member receive frames captured at
//! the same instant, identified by equal sequence numbers.
//!
//! Each member has two slots:
//!
//! - `last`: the newest frame received for that member and not yet matched.
//! - `synced`: a frame that belongs to a matched set and waits for delivery.
//!
//! When every enabled member holds a `last` frame with the same sequence
//! number, the frames are *latched*: moved into `synced` and every member is
//! woken. Members are never starved by a partner that lost a frame: a read
//! that finds another member still holding an older `synced` frame drops the
//! whole stale set, and a read can latch a set that the producer path could
//! not complete.
//!
//! # Loss accounting
//!
//! Dropping a stale set is silent for readers; [`FrameSyncGroup::dropped_sets`]
//! counts how often it happened.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tracing::{debug, trace};

use crate::{
    holder::{HolderRead, StreamSignal},
    pool::FrameRef,
    stream::{Stream, StreamId},
    Error, Result,
};

#[derive(Debug)]
struct Member {
    signal: Arc<StreamSignal>,
    enabled: bool,
    last: Option<FrameRef>,
    synced: Option<FrameRef>,
}

impl Member {
    fn id(&self) -> StreamId {
        self.signal.id()
    }
}

#[derive(Debug)]
struct GroupState {
    enabled: bool,
    members: Vec<Member>,
}

impl GroupState {
    fn position(&self, stream: StreamId) -> Option<usize> {
        self.members.iter().position(|member| member.id() == stream)
    }

    fn enabled_count(&self) -> usize {
        self.members.iter().filter(|member| member.enabled).count()
    }

    /// Moves every member's `last` frame into `synced`, releasing whatever
    /// was there, and returns the signals of the members that now have a
    /// frame to read. They are raised once the lock is dropped.
    fn latch(&mut self) -> Vec<Arc<StreamSignal>> {
        for member in &mut self.members {
            member.synced = member.last.take();
        }
        self.members
            .iter()
            .filter(|member| member.synced.is_some())
            .map(|member| Arc::clone(&member.signal))
            .collect()
    }

    fn take_all(&mut self) -> Vec<FrameRef> {
        let mut frames = Vec::new();
        for member in &mut self.members {
            frames.extend(member.last.take());
            frames.extend(member.synced.take());
        }
        frames
    }
}

/// Latches same-sequence frames across a fixed set of member streams.
///
/// Membership is fixed at construction; changing it means building a new
/// holder and rewiring the streams.
pub(crate) struct SyncedGroupHolder {
    state: Mutex<GroupState>,
    dropped_sets: AtomicU64,
}

impl fmt::Debug for SyncedGroupHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedGroupHolder")
            .field("members", &self.members())
            .field("dropped_sets", &self.dropped_sets())
            .finish()
    }
}

impl SyncedGroupHolder {
    /// Builds a group; each member starts enabled if its stream is started.
    pub(crate) fn new(members: Vec<(Arc<StreamSignal>, bool)>) -> Self {
        let members = members
            .into_iter()
            .map(|(signal, enabled)| Member {
                signal,
                enabled,
                last: None,
                synced: None,
            })
            .collect();
        Self {
            state: Mutex::new(GroupState {
                enabled: true,
                members,
            }),
            dropped_sets: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unknown_stream(stream: StreamId) -> Error {
        debug_assert!(false, "stream {stream} routed to a sync group it is not part of");
        Error::BadParameter(format!("stream {stream} is not a member of this sync group"))
    }

    pub(crate) fn process_new_frame(&self, stream: StreamId, frame: FrameRef) -> Result<()> {
        let wake = {
            let mut state = self.lock();
            if !state.enabled {
                return Ok(());
            }
            let pos = state
                .position(stream)
                .ok_or_else(|| Self::unknown_stream(stream))?;

            let seq = frame.frame_index;
            let member = &mut state.members[pos];
            member.last = None;
            if member.enabled {
                member.last = Some(frame);
            }

            let enabled = state.enabled_count();
            let valid = state
                .members
                .iter()
                .filter(|m| m.enabled)
                .filter(|m| m.last.as_ref().is_some_and(|f| f.frame_index == seq))
                .count();
            let synced = state.members.iter().filter(|m| m.synced.is_some()).count();

            if enabled > 0 && valid == enabled && (synced == 0 || synced == enabled) {
                trace!(seq, "synchronized set latched");
                state.latch()
            } else {
                Vec::new()
            }
        };

        for signal in wake {
            signal.deliver();
        }
        Ok(())
    }

    pub(crate) fn read_frame(&self, stream: StreamId) -> Result<HolderRead> {
        loop {
            let mut state = self.lock();
            if !state.enabled {
                return Ok(HolderRead::Disabled);
            }
            let pos = state
                .position(stream)
                .ok_or_else(|| Self::unknown_stream(stream))?;

            let taken = {
                let member = &mut state.members[pos];
                match member.synced.take() {
                    Some(frame) => Some((frame, false)),
                    None => member.last.take().map(|frame| (frame, true)),
                }
            };
            let Some((frame, from_last)) = taken else {
                let signal = Arc::clone(&state.members[pos].signal);
                drop(state);
                signal.wait()?;
                continue;
            };

            let seq = frame.frame_index;
            let oldest_other = state
                .members
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != pos)
                .filter_map(|(_, m)| m.synced.as_ref().map(|f| f.frame_index))
                .min();
            if let Some(stale) = oldest_other.filter(|stale| *stale < seq) {
                for member in &mut state.members {
                    member.synced = None;
                }
                self.dropped_sets.fetch_add(1, Ordering::Relaxed);
                debug!(stale, current = seq, "stale synchronized set invalidated");
            }

            let wake = if state.members.iter().all(|m| m.synced.is_none())
                && Self::candidates_match(&state, pos, from_last.then_some(seq))
            {
                trace!(seq, "synchronized set latched on read");
                state.latch()
            } else {
                Vec::new()
            };
            drop(state);

            for signal in wake {
                signal.deliver();
            }
            return Ok(HolderRead::Frame(frame));
        }
    }

    /// True if every enabled member has a pending frame and all of them carry
    /// the same sequence number. The reader's own candidate is the frame it
    /// just took from `last`, if any.
    fn candidates_match(state: &GroupState, reader: usize, taken_seq: Option<u64>) -> bool {
        let mut expected = None;
        let mut any = false;
        for (i, member) in state.members.iter().enumerate() {
            if !member.enabled {
                continue;
            }
            let candidate = if i == reader {
                taken_seq.or_else(|| member.last.as_ref().map(|f| f.frame_index))
            } else {
                member.last.as_ref().map(|f| f.frame_index)
            };
            let Some(candidate) = candidate else {
                return false;
            };
            match expected {
                None => expected = Some(candidate),
                Some(seq) if seq != candidate => return false,
                Some(_) => {}
            }
            any = true;
        }
        any
    }

    /// The latched frame waiting for `stream`, if any.
    pub(crate) fn peek_frame(&self, stream: StreamId) -> Option<FrameRef> {
        let state = self.lock();
        if !state.enabled {
            return None;
        }
        let pos = state.position(stream)?;
        state.members[pos].synced.clone()
    }

    pub(crate) fn peek_timestamp(&self, stream: StreamId) -> Option<u64> {
        let state = self.lock();
        if !state.enabled {
            return None;
        }
        let pos = state.position(stream)?;
        state.members[pos].synced.as_ref().map(|f| f.timestamp)
    }

    pub(crate) fn clear(&self) {
        let frames = self.lock().take_all();
        drop(frames);
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        let (frames, signals) = {
            let mut state = self.lock();
            state.enabled = enabled;
            if enabled {
                return;
            }
            let signals: Vec<_> = state
                .members
                .iter()
                .map(|member| Arc::clone(&member.signal))
                .collect();
            (state.take_all(), signals)
        };
        drop(frames);
        for signal in signals {
            signal.wake();
        }
    }

    pub(crate) fn set_stream_enabled(&self, stream: StreamId, enabled: bool) {
        let released = {
            let mut state = self.lock();
            let Some(pos) = state.position(stream) else {
                return;
            };
            let member = &mut state.members[pos];
            member.enabled = enabled;
            if enabled {
                Vec::new()
            } else {
                member.last.take().into_iter().chain(member.synced.take()).collect()
            }
        };
        drop(released);
    }

    pub(crate) fn members(&self) -> Vec<StreamId> {
        self.lock().members.iter().map(Member::id).collect()
    }

    pub(crate) fn dropped_sets(&self) -> u64 {
        self.dropped_sets.load(Ordering::Relaxed)
    }
}

/// Handle to an active frame sync group.
///
/// Returned by [`crate::Context::enable_frame_sync`] and handed back to
/// [`crate::Context::disable_frame_sync`] to tear the group down. Dropping
/// the handle without disabling leaves the group in place until one of its
/// streams is destroyed or the context shuts down.
pub struct FrameSyncGroup {
    pub(crate) holder: Arc<SyncedGroupHolder>,
    pub(crate) streams: Vec<Stream>,
}

impl FrameSyncGroup {
    /// The member streams, in the order they were given.
    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    /// Number of latched sets discarded because a partner stream moved past
    /// them before they were read.
    pub fn dropped_sets(&self) -> u64 {
        self.holder.dropped_sets()
    }
}

impl fmt::Debug for FrameSyncGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSyncGroup")
            .field("streams", &self.streams.iter().map(Stream::id).collect::<Vec<_>>())
            .field("dropped_sets", &self.dropped_sets())
            .finish()
    }
}

//! Per-player input history.
//!
//! [`InputBuffer`] stores each player's inputs in ascending frame order,
//! whatever order they arrive in, and keeps at most `buffer_size` frames per
//! player by evicting the oldest. Missing frames can be filled with
//! [`predict_input`](InputBuffer::predict_input), which holds the last known
//! input.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use crate::protocol::{now_millis, InputKeys, InputPayload, PlayerId};

/// Input of one player for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InputFrame {
    pub frame: u64,
    pub player_id: PlayerId,
    pub inputs: InputKeys,
    pub mouse_x: Option<f32>,
    pub mouse_y: Option<f32>,
    pub mouse_buttons: Option<u8>,
    pub custom: Option<Value>,
    /// Milliseconds since the Unix epoch when the frame was stored.
    pub timestamp: u64,
    pub acknowledged: bool,
}

impl InputFrame {
    /// The wire form of this frame's inputs.
    pub fn payload(&self) -> InputPayload {
        InputPayload {
            keys: self.inputs,
            mouse_x: self.mouse_x,
            mouse_y: self.mouse_y,
            mouse_buttons: self.mouse_buttons,
            custom: self.custom.clone(),
        }
    }
}

/// Optional extras stored alongside the key bitmask.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputExtra {
    pub mouse_x: Option<f32>,
    pub mouse_y: Option<f32>,
    pub mouse_buttons: Option<u8>,
    pub custom: Option<Value>,
}

impl From<InputPayload> for InputExtra {
    fn from(payload: InputPayload) -> Self {
        Self {
            mouse_x: payload.mouse_x,
            mouse_y: payload.mouse_y,
            mouse_buttons: payload.mouse_buttons,
            custom: payload.custom,
        }
    }
}

/// Bounded, frame-ordered input store keyed by player.
#[derive(Debug, Clone)]
pub struct InputBuffer {
    buffer_size: usize,
    players: HashMap<PlayerId, VecDeque<InputFrame>>,
}

impl InputBuffer {
    /// Create a buffer keeping at most `buffer_size` frames per player
    /// (clamped to at least 1).
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            players: HashMap::new(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Store an input. A frame that is already stored for the player is
    /// replaced. Returns the stored frame.
    pub fn add_input(
        &mut self,
        player_id: &str,
        frame: u64,
        inputs: InputKeys,
        extra: InputExtra,
    ) -> InputFrame {
        let entry = InputFrame {
            frame,
            player_id: player_id.to_owned(),
            inputs,
            mouse_x: extra.mouse_x,
            mouse_y: extra.mouse_y,
            mouse_buttons: extra.mouse_buttons,
            custom: extra.custom,
            timestamp: now_millis(),
            acknowledged: false,
        };

        let frames = self.players.entry(player_id.to_owned()).or_default();
        let at = frames.partition_point(|f| f.frame < frame);
        match frames.get_mut(at) {
            Some(existing) if existing.frame == frame => *existing = entry.clone(),
            _ => frames.insert(at, entry.clone()),
        }
        while frames.len() > self.buffer_size {
            frames.pop_front();
        }
        entry
    }

    /// The input stored for exactly `frame`.
    pub fn get_input(&self, player_id: &str, frame: u64) -> Option<&InputFrame> {
        let frames = self.players.get(player_id)?;
        let at = frames.partition_point(|f| f.frame < frame);
        frames.get(at).filter(|f| f.frame == frame)
    }

    /// The highest-frame input stored for the player.
    pub fn get_latest_input(&self, player_id: &str) -> Option<&InputFrame> {
        self.players.get(player_id)?.back()
    }

    /// Stored inputs with `start <= frame <= end`, ascending.
    pub fn get_input_range(&self, player_id: &str, start: u64, end: u64) -> Vec<InputFrame> {
        self.players
            .get(player_id)
            .map(|frames| {
                frames
                    .iter()
                    .skip_while(|f| f.frame < start)
                    .take_while(|f| f.frame <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark every stored frame up to and including `up_to_frame` acknowledged.
    pub fn acknowledge_inputs(&mut self, player_id: &str, up_to_frame: u64) {
        if let Some(frames) = self.players.get_mut(player_id) {
            frames
                .iter_mut()
                .take_while(|f| f.frame <= up_to_frame)
                .for_each(|f| f.acknowledged = true);
        }
    }

    /// Stored frames not yet acknowledged, ascending.
    pub fn get_unacknowledged_inputs(&self, player_id: &str) -> Vec<InputFrame> {
        self.players
            .get(player_id)
            .map(|frames| frames.iter().filter(|f| !f.acknowledged).cloned().collect())
            .unwrap_or_default()
    }

    /// Predict the input for `frame` by repeating the latest stored input
    /// strictly before it. The prediction is not stored.
    pub fn predict_input(&self, player_id: &str, frame: u64) -> Option<InputFrame> {
        let frames = self.players.get(player_id)?;
        let before = frames.partition_point(|f| f.frame < frame);
        let last = frames.get(before.checked_sub(1)?)?;
        Some(InputFrame {
            frame,
            timestamp: now_millis(),
            acknowledged: false,
            ..last.clone()
        })
    }

    /// Number of frames stored for the player.
    pub fn len(&self, player_id: &str) -> usize {
        self.players.get(player_id).map_or(0, VecDeque::len)
    }

    /// `true` if nothing is stored for any player.
    pub fn is_empty(&self) -> bool {
        self.players.values().all(VecDeque::is_empty)
    }

    /// Forget every input of one player.
    pub fn clear_player(&mut self, player_id: &str) {
        self.players.remove(player_id);
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.players.clear();
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new(60)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn add(buffer: &mut InputBuffer, frame: u64, bits: u32) {
        buffer.add_input("p1", frame, InputKeys::from_bits_retain(bits), InputExtra::default());
    }

    fn frames(buffer: &InputBuffer) -> Vec<u64> {
        buffer
            .get_input_range("p1", 0, u64::MAX)
            .iter()
            .map(|f| f.frame)
            .collect()
    }

    #[test]
    fn out_of_order_inputs_are_sorted() {
        let mut buffer = InputBuffer::new(10);
        for frame in [5, 1, 3, 2, 4] {
            add(&mut buffer, frame, 0);
        }
        assert_eq!(frames(&buffer), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn duplicate_frame_replaces_existing_entry() {
        let mut buffer = InputBuffer::new(10);
        add(&mut buffer, 3, 1);
        add(&mut buffer, 3, 2);
        assert_eq!(buffer.len("p1"), 1);
        assert_eq!(buffer.get_input("p1", 3).unwrap().inputs, InputKeys::DOWN);
    }

    #[test]
    fn overflow_evicts_oldest_frames() {
        let mut buffer = InputBuffer::new(3);
        for frame in 1..=5 {
            add(&mut buffer, frame, 0);
        }
        assert_eq!(frames(&buffer), vec![3, 4, 5]);
    }

    #[test]
    fn late_frame_older_than_window_is_evicted_immediately() {
        let mut buffer = InputBuffer::new(2);
        add(&mut buffer, 10, 0);
        add(&mut buffer, 11, 0);
        add(&mut buffer, 1, 0);
        assert_eq!(frames(&buffer), vec![10, 11]);
    }

    #[test]
    fn exact_lookup_and_latest() {
        let mut buffer = InputBuffer::new(10);
        add(&mut buffer, 2, 0);
        add(&mut buffer, 7, InputKeys::JUMP.bits());
        assert!(buffer.get_input("p1", 3).is_none());
        assert!(buffer.get_input("p2", 2).is_none());
        assert_eq!(buffer.get_latest_input("p1").unwrap().frame, 7);
    }

    #[test]
    fn range_is_inclusive() {
        let mut buffer = InputBuffer::new(10);
        for frame in 1..=6 {
            add(&mut buffer, frame, 0);
        }
        let range: Vec<u64> = buffer
            .get_input_range("p1", 2, 4)
            .iter()
            .map(|f| f.frame)
            .collect();
        assert_eq!(range, vec![2, 3, 4]);
    }

    #[test]
    fn acknowledge_splits_unacknowledged() {
        let mut buffer = InputBuffer::new(10);
        for frame in 1..=5 {
            add(&mut buffer, frame, 0);
        }
        buffer.acknowledge_inputs("p1", 3);
        let pending: Vec<u64> = buffer
            .get_unacknowledged_inputs("p1")
            .iter()
            .map(|f| f.frame)
            .collect();
        assert_eq!(pending, vec![4, 5]);
        assert!(buffer.get_input("p1", 3).unwrap().acknowledged);
    }

    #[test]
    fn prediction_holds_last_input_before_frame() {
        let mut buffer = InputBuffer::new(10);
        add(&mut buffer, 1, InputKeys::LEFT.bits());
        add(&mut buffer, 4, InputKeys::RIGHT.bits());
        add(&mut buffer, 9, InputKeys::UP.bits());
        buffer.acknowledge_inputs("p1", 9);

        let predicted = buffer.predict_input("p1", 6).unwrap();
        assert_eq!(predicted.frame, 6);
        assert_eq!(predicted.inputs, InputKeys::RIGHT);
        assert!(!predicted.acknowledged);
        assert!(buffer.get_input("p1", 6).is_none(), "prediction is not stored");
    }

    #[test]
    fn prediction_without_earlier_frame_is_none() {
        let mut buffer = InputBuffer::new(10);
        add(&mut buffer, 5, 0);
        assert!(buffer.predict_input("p1", 5).is_none());
        assert!(buffer.predict_input("p1", 2).is_none());
        assert!(buffer.predict_input("nobody", 2).is_none());
    }

    #[test]
    fn clear_player_only_touches_that_player() {
        let mut buffer = InputBuffer::new(10);
        add(&mut buffer, 1, 0);
        buffer.add_input("p2", 1, InputKeys::empty(), InputExtra::default());
        buffer.clear_player("p1");
        assert_eq!(buffer.len("p1"), 0);
        assert_eq!(buffer.len("p2"), 1);
        assert!(!buffer.is_empty());
    }

    proptest! {
        #[test]
        fn prop_range_is_always_ascending(
            order in prop::collection::vec(0u64..500, 1..200),
            size in 1usize..80,
        ) {
            let mut buffer = InputBuffer::new(size);
            for frame in &order {
                add(&mut buffer, *frame, 0);
            }
            let stored = frames(&buffer);
            prop_assert!(stored.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(stored.len() <= size);
        }

        #[test]
        fn prop_buffer_keeps_newest_frames(
            count in 1u64..300,
            size in 1usize..60,
        ) {
            let mut buffer = InputBuffer::new(size);
            for frame in 0..count {
                add(&mut buffer, frame, 0);
            }
            let stored = frames(&buffer);
            let expected: Vec<u64> =
                (count.saturating_sub(size as u64)..count).collect();
            prop_assert_eq!(stored, expected);
        }
    }
}

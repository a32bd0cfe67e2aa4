use log::warn;
use std::collections::VecDeque;

use crate::packet::SendPacketVector;

/// Most frames that may be in flight at once. Frame ids travel as 8 bits, so
/// this has to stay well below 256.
pub const MAX_UNACKED_FRAMES: usize = 120;

/// Retransmission buffer: the packets of every frame not yet acknowledged.
///
/// Frames are stored in contiguous frame id order. Released frames leave an
/// empty slot behind until every older frame is released too, which keeps
/// lookup a plain offset from `first_frame_id_in_list`.
#[derive(Debug)]
pub struct PacketStorage {
    frames: VecDeque<SendPacketVector>,
    first_frame_id_in_list: u32,
    zombie_count: usize,
    max_stored_frames: usize,
}

impl Default for PacketStorage {
    fn default() -> Self {
        PacketStorage::new(MAX_UNACKED_FRAMES)
    }
}

impl PacketStorage {
    pub fn new(max_stored_frames: usize) -> Self {
        PacketStorage {
            frames: VecDeque::new(),
            first_frame_id_in_list: 0,
            zombie_count: 0,
            max_stored_frames: max_stored_frames.clamp(1, MAX_UNACKED_FRAMES),
        }
    }

    /// Number of frames currently held, not counting released slots.
    pub fn number_of_stored_frames(&self) -> usize {
        self.frames.len() - self.zombie_count
    }

    /// Appends the packets of `frame_id`.
    ///
    /// # Panics
    ///
    /// Panics if `frame_id` does not directly follow the last stored frame or
    /// `packets` is empty.
    pub fn store_frame(&mut self, frame_id: u32, packets: SendPacketVector) {
        assert!(!packets.is_empty(), "cannot store frame {frame_id} without packets");

        if self.frames.is_empty() {
            self.first_frame_id_in_list = frame_id;
        } else {
            let expected = self
                .first_frame_id_in_list
                .wrapping_add(self.frames.len() as u32);
            assert_eq!(
                expected, frame_id,
                "frames must be stored contiguously: expected {expected}, got {frame_id}"
            );
        }

        if self.number_of_stored_frames() >= self.max_stored_frames {
            warn!(
                "packet storage full, dropping frame {} to store frame {}",
                self.first_frame_id_in_list, frame_id
            );
            self.frames.pop_front();
            self.first_frame_id_in_list = self.first_frame_id_in_list.wrapping_add(1);
            self.compact();
        }

        self.frames.push_back(packets);
    }

    /// Drops the packets of `frame_id`; unknown or already released ids are
    /// ignored.
    pub fn release_frame(&mut self, frame_id: u32) {
        let offset = frame_id.wrapping_sub(self.first_frame_id_in_list);
        if (offset as i32) < 0 || offset as usize >= self.frames.len() {
            return;
        }
        let slot = &mut self.frames[offset as usize];
        if slot.is_empty() {
            return;
        }
        slot.clear();
        self.zombie_count += 1;
        self.compact();
    }

    /// Looks a frame up by the low 8 bits of its id.
    pub fn get_frame8(&self, frame_id_8bits: u8) -> Option<&SendPacketVector> {
        let offset = frame_id_8bits.wrapping_sub(self.first_frame_id_in_list as u8) as usize;
        self.frames.get(offset).filter(|packets| !packets.is_empty())
    }

    pub fn get_frame(&self, frame_id: u32) -> Option<&SendPacketVector> {
        let offset = frame_id.wrapping_sub(self.first_frame_id_in_list);
        if (offset as i32) < 0 {
            return None;
        }
        self.frames
            .get(offset as usize)
            .filter(|packets| !packets.is_empty())
    }

    fn compact(&mut self) {
        while self.frames.front().is_some_and(|f| f.is_empty()) {
            self.frames.pop_front();
            self.zombie_count -= 1;
            self.first_frame_id_in_list = self.first_frame_id_in_list.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketKey, PacketRef};
    use std::time::Instant;

    fn packets(frame_id: u32, count: u16) -> SendPacketVector {
        let now = Instant::now();
        (0..count)
            .map(|packet_id| {
                (
                    PacketKey::new(now, 1, frame_id, packet_id),
                    PacketRef::new(vec![frame_id as u8, packet_id as u8]),
                )
            })
            .collect()
    }

    #[test]
    fn test_store_and_release() {
        let mut storage = PacketStorage::default();
        for frame_id in 10..20 {
            storage.store_frame(frame_id, packets(frame_id, 2));
        }
        assert_eq!(storage.number_of_stored_frames(), 10);

        // out of order release leaves a zombie slot
        storage.release_frame(12);
        assert_eq!(storage.number_of_stored_frames(), 9);
        assert!(storage.get_frame8(12).is_none());
        assert!(storage.get_frame8(11).is_some());

        storage.release_frame(10);
        storage.release_frame(11);
        assert_eq!(storage.number_of_stored_frames(), 7);
        assert!(storage.get_frame8(10).is_none());
        assert_eq!(storage.get_frame8(13).map(|f| f.len()), Some(2));
        assert_eq!(storage.get_frame(19).map(|f| f[0].0.frame_id), Some(19));

        // releasing twice is harmless
        storage.release_frame(12);
        storage.release_frame(99);
        assert_eq!(storage.number_of_stored_frames(), 7);
    }

    #[test]
    fn test_bounded_to_max_unacked_frames() {
        let mut storage = PacketStorage::default();
        for frame_id in 0..120 {
            storage.store_frame(frame_id, packets(frame_id, 1));
        }
        assert_eq!(storage.number_of_stored_frames(), 120);

        storage.store_frame(120, packets(120, 1));
        assert!(storage.number_of_stored_frames() <= MAX_UNACKED_FRAMES);
        assert!(storage.get_frame8(0).is_none());
        assert!(storage.get_frame8(120).is_some());

        storage.release_frame(5);
        assert!(storage.get_frame8(5).is_none());
    }

    #[test]
    fn test_frame_id_wrap() {
        let mut storage = PacketStorage::default();
        let start = u32::MAX - 2;
        for i in 0..6u32 {
            storage.store_frame(start.wrapping_add(i), packets(start.wrapping_add(i), 1));
        }
        assert!(storage.get_frame8(0xfe).is_some());
        assert!(storage.get_frame8(2).is_some());
        assert!(storage.get_frame8(3).is_none());
        assert_eq!(storage.get_frame(1).map(|f| f[0].0.frame_id), Some(1));
    }

    #[test]
    #[should_panic(expected = "contiguously")]
    fn test_non_contiguous_store_panics() {
        let mut storage = PacketStorage::default();
        storage.store_frame(1, packets(1, 1));
        storage.store_frame(3, packets(3, 1));
    }
}

// crates/clipbatch-media/src/index.rs
//
// Per-video packet index and batch scheduler. Pure data and arithmetic — no
// ffmpeg handle, no I/O — so it's exercised directly with hand-built packet
// lists in tests instead of a real container fixture.

use std::collections::BTreeMap;

use clipbatch_core::ClipBatchError;

/// One packet as seen during the initial indexing scan, already remapped so
/// `key_frame_index` and `pts` refer to *sorted* (display) order rather than
/// the raw decode order the packets originally arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedPacket {
    pub pts: i64,
    pub is_key: bool,
    /// Position of this packet in raw decode order — the order the demuxer
    /// actually produced it in, before the pts-sort below.
    pub packet_order: usize,
    /// Sorted-order position of the key frame that must be decoded from to
    /// reach this packet.
    pub key_frame_index: usize,
}

/// A video's packets, sorted by presentation order. `indices ⊆ [0,
/// len())` passed to `get_batch` refer to positions in this ordering.
pub struct PacketIndex {
    packets: Vec<IndexedPacket>,
}

impl PacketIndex {
    pub fn num_frames(&self) -> usize {
        self.packets.len()
    }

    pub fn get(&self, sorted_index: usize) -> Option<&IndexedPacket> {
        self.packets.get(sorted_index)
    }

    /// Builds the index from a raw scan: `(pts, is_key)` in decode order.
    /// Asserts the stream opens on a key frame, which every container this
    /// loader targets guarantees — a violation means the file is corrupt or
    /// wasn't actually seekable from frame zero.
    pub fn build(raw: &[(i64, bool)]) -> Result<Self, ClipBatchError> {
        if raw.is_empty() {
            return Ok(Self { packets: Vec::new() });
        }
        if !raw[0].1 {
            return Err(ClipBatchError::media(
                0,
                "first packet in decode order is not a key frame",
                "index::build",
            ));
        }

        // Pass 1: for each raw position, the raw position of the key frame
        // governing it (the nearest key frame at or before it in decode
        // order — decoding must restart there to reach this packet).
        let mut governing_key_raw = vec![0usize; raw.len()];
        let mut last_key_raw = 0usize;
        for (r, &(_, is_key)) in raw.iter().enumerate() {
            if is_key {
                last_key_raw = r;
            }
            governing_key_raw[r] = last_key_raw;
        }

        // Pass 2: stable sort raw indices by pts to get display order.
        let mut sorted_raw: Vec<usize> = (0..raw.len()).collect();
        sorted_raw.sort_by_key(|&r| raw[r].0);

        let mut sorted_index_of_raw = vec![0usize; raw.len()];
        for (sorted_pos, &r) in sorted_raw.iter().enumerate() {
            sorted_index_of_raw[r] = sorted_pos;
        }

        let packets = sorted_raw
            .iter()
            .map(|&r| {
                let (pts, is_key) = raw[r];
                IndexedPacket {
                    pts,
                    is_key,
                    packet_order: r,
                    key_frame_index: sorted_index_of_raw[governing_key_raw[r]],
                }
            })
            .collect();

        Ok(Self { packets })
    }
}

/// One requested output position paired with the sorted-order frame it
/// wants. Several requests may name the same `frame_index` (duplicate
/// frames in a batch) or land on the same `pts` (frames sharing a
/// presentation timestamp) — both are filled from a single decoded frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameRequest {
    pub output_slot: usize,
    pub frame_index: usize,
}

/// One contiguous decode run: seek once to `key_frame_pts`, then read
/// forward keeping only packets whose pts is in `wanted`.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub key_frame_index: usize,
    pub key_frame_pts: i64,
    pub key_frame_packet_order: usize,
    /// Highest raw `packet_order` among packets this entry (after any
    /// merges) still needs — used to detect a run's adjacency to the next.
    pub last_packet_order: usize,
    /// pts → output slots waiting on a frame at that pts.
    pub wanted: BTreeMap<i64, Vec<usize>>,
}

/// Groups `requests` into seek runs against `index`, merging adjacent runs
/// that don't actually need a re-seek (the next run's key frame immediately
/// follows the previous run's last needed packet in decode order).
pub fn schedule(
    index: &PacketIndex,
    requests: &[FrameRequest],
) -> Result<Vec<ScheduleEntry>, ClipBatchError> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }

    // Group requests by the key frame they hang off of.
    let mut by_key_frame: BTreeMap<usize, ScheduleEntry> = BTreeMap::new();
    for req in requests {
        let packet = index.get(req.frame_index).ok_or_else(|| {
            ClipBatchError::out_of_range(req.frame_index, index.num_frames())
        })?;

        let key_frame_index = packet.key_frame_index;
        let key_packet = index.get(key_frame_index).ok_or_else(|| {
            ClipBatchError::logic(format!(
                "key_frame_index {key_frame_index} out of bounds in packet index"
            ))
        })?;

        let entry = by_key_frame.entry(key_frame_index).or_insert_with(|| ScheduleEntry {
            key_frame_index,
            key_frame_pts: key_packet.pts,
            key_frame_packet_order: key_packet.packet_order,
            last_packet_order: key_packet.packet_order,
            wanted: BTreeMap::new(),
        });
        entry.wanted.entry(packet.pts).or_default().push(req.output_slot);
        entry.last_packet_order = entry.last_packet_order.max(packet.packet_order);
    }

    let mut entries: Vec<ScheduleEntry> = by_key_frame.into_values().collect();
    entries.sort_by_key(|e| e.key_frame_index);

    // Merge runs where the next entry's key frame falls immediately after
    // the previous entry's last needed packet in decode order — re-seeking
    // would just rewind into bytes the demuxer is already sitting on.
    let mut merged: Vec<ScheduleEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        let should_merge = merged
            .last()
            .map(|prev: &ScheduleEntry| entry.key_frame_packet_order == prev.last_packet_order + 1)
            .unwrap_or(false);

        if should_merge {
            let prev = merged.last_mut().unwrap();
            for (pts, slots) in entry.wanted {
                prev.wanted.entry(pts).or_default().extend(slots);
            }
            prev.last_packet_order = prev.last_packet_order.max(entry.last_packet_order);
        } else {
            merged.push(entry);
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    // decode order: K P P K P P P K P  (K = key frame)
    // pts happens to equal decode order here for the simple cases; a
    // separate test covers decode-order != display-order containers.
    fn linear_raw(n: usize, key_every: usize) -> Vec<(i64, bool)> {
        (0..n).map(|i| (i as i64, i % key_every == 0)).collect()
    }

    #[test]
    fn build_rejects_non_keyframe_start() {
        let raw = vec![(0, false), (1, true)];
        let err = PacketIndex::build(&raw).unwrap_err();
        assert!(err.to_string().contains("not a key frame"));
    }

    #[test]
    fn build_is_identity_when_pts_matches_decode_order() {
        let raw = linear_raw(9, 3);
        let index = PacketIndex::build(&raw).unwrap();
        assert_eq!(index.num_frames(), 9);
        for i in 0..9 {
            let p = index.get(i).unwrap();
            assert_eq!(p.pts, i as i64);
            assert_eq!(p.packet_order, i);
        }
        // frames 3,4,5 hang off key frame at sorted position 3
        assert_eq!(index.get(4).unwrap().key_frame_index, 3);
        assert_eq!(index.get(5).unwrap().key_frame_index, 3);
        assert_eq!(index.get(8).unwrap().key_frame_index, 6);
    }

    #[test]
    fn build_remaps_key_frame_index_when_decode_order_differs_from_pts() {
        // Raw decode order: pts values 0, 2, 1, 3 (B-frame reorder), all one GOP.
        let raw = vec![(0, true), (2, false), (1, false), (3, false)];
        let index = PacketIndex::build(&raw).unwrap();
        // Sorted order by pts: 0,1,2,3 -> sorted positions 0,1,2,3
        // all governed by the single key frame at raw position 0, whose
        // sorted position is 0.
        for i in 0..4 {
            assert_eq!(index.get(i).unwrap().key_frame_index, 0);
        }
        assert_eq!(index.get(0).unwrap().pts, 0);
        assert_eq!(index.get(1).unwrap().pts, 1);
        assert_eq!(index.get(2).unwrap().pts, 2);
        assert_eq!(index.get(3).unwrap().pts, 3);
    }

    #[test]
    fn schedule_groups_by_key_frame() {
        let raw = linear_raw(9, 3);
        let index = PacketIndex::build(&raw).unwrap();
        let requests = vec![
            FrameRequest { output_slot: 0, frame_index: 1 },
            FrameRequest { output_slot: 1, frame_index: 4 },
            FrameRequest { output_slot: 2, frame_index: 7 },
        ];
        let entries = schedule(&index, &requests).unwrap();
        // 1 -> key 0, 4 -> key 3, 7 -> key 6: three separate GOPs, not
        // adjacent (key 3's packet_order 3 != prev last_packet_order 1 + 1... )
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key_frame_pts, 0);
        assert_eq!(entries[1].key_frame_pts, 3);
        assert_eq!(entries[2].key_frame_pts, 6);
    }

    #[test]
    fn schedule_merges_adjacent_runs() {
        let raw = linear_raw(9, 3);
        let index = PacketIndex::build(&raw).unwrap();
        // frame 2 (last_packet_order=2, key 0) and frame 3 (key frame itself,
        // packet_order 3) are adjacent: 3 == 2 + 1, so no re-seek needed.
        let requests = vec![
            FrameRequest { output_slot: 0, frame_index: 2 },
            FrameRequest { output_slot: 1, frame_index: 3 },
        ];
        let entries = schedule(&index, &requests).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key_frame_pts, 0);
        assert!(entries[0].wanted.contains_key(&2));
        assert!(entries[0].wanted.contains_key(&3));
    }

    #[test]
    fn schedule_duplicate_frame_indices_share_one_wanted_pts() {
        let raw = linear_raw(6, 3);
        let index = PacketIndex::build(&raw).unwrap();
        let requests = vec![
            FrameRequest { output_slot: 0, frame_index: 4 },
            FrameRequest { output_slot: 1, frame_index: 4 },
        ];
        let entries = schedule(&index, &requests).unwrap();
        assert_eq!(entries.len(), 1);
        let slots = entries[0].wanted.get(&4).unwrap();
        assert_eq!(slots.len(), 2);
        assert!(slots.contains(&0) && slots.contains(&1));
    }

    #[test]
    fn schedule_out_of_range_is_an_error() {
        let raw = linear_raw(4, 4);
        let index = PacketIndex::build(&raw).unwrap();
        let requests = vec![FrameRequest { output_slot: 0, frame_index: 10 }];
        let err = schedule(&index, &requests).unwrap_err();
        assert!(matches!(err, ClipBatchError::OutOfRange { index: 10, num_frames: 4 }));
    }

    #[test]
    fn schedule_empty_request_yields_no_entries() {
        let raw = linear_raw(4, 4);
        let index = PacketIndex::build(&raw).unwrap();
        let entries = schedule(&index, &[]).unwrap();
        assert!(entries.is_empty());
    }
}

//! Segment filling: addressing, reference selection and block generation.

use super::Variant;
use super::block::Block;
use crate::error::{Error, Result};

/// Slices per lane per pass.
pub const SYNC_POINTS: u32 = 4;
const ADDRESSES_IN_BLOCK: u32 = 128;

/// Where a segment sits in the fill schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub pass: u32,
    pub lane: u32,
    pub slice: u32,
}

/// Shape of an instance's memory matrix.
#[derive(Debug, Clone, Copy)]
pub(super) struct Geometry {
    pub variant: Variant,
    pub passes: u32,
    pub lanes: u32,
    pub lane_length: u32,
    pub segment_length: u32,
    pub memory_blocks: u32,
}

impl Geometry {
    pub fn check(&self, pos: Position) -> Result<()> {
        if self.segment_length < 2 || self.memory_blocks != self.lane_length * self.lanes {
            return Err(Error::Kdf("instance has no usable memory".into()));
        }
        if pos.pass >= self.passes || pos.lane >= self.lanes || pos.slice >= SYNC_POINTS {
            return Err(Error::Kdf(format!(
                "position {pos:?} outside {} passes, {} lanes",
                self.passes, self.lanes
            )));
        }
        Ok(())
    }

    fn independent_addressing(&self, pos: Position) -> bool {
        match self.variant {
            Variant::Argon2i => true,
            Variant::Argon2d => false,
            Variant::Argon2id => pos.pass == 0 && pos.slice < SYNC_POINTS / 2,
        }
    }
}

/// Read access to every block outside the segments being filled in one slice.
///
/// Each lane is split into the blocks before and after the current slice's
/// segment; the segments themselves are handed out mutably, one per lane.
pub(super) struct SliceView<'a> {
    slice: u32,
    segment_length: u32,
    rest: Vec<(&'a [Block], &'a [Block])>,
}

impl<'a> SliceView<'a> {
    pub fn split(
        memory: &'a mut [Block],
        geometry: &Geometry,
        slice: u32,
    ) -> (Self, Vec<&'a mut [Block]>) {
        let start = (slice * geometry.segment_length) as usize;
        let mut rest = Vec::with_capacity(geometry.lanes as usize);
        let mut segments = Vec::with_capacity(geometry.lanes as usize);

        for lane in memory.chunks_mut(geometry.lane_length as usize) {
            let (before, tail) = lane.split_at_mut(start);
            let (segment, after) = tail.split_at_mut(geometry.segment_length as usize);
            rest.push((&*before, &*after));
            segments.push(segment);
        }

        let view = Self {
            slice,
            segment_length: geometry.segment_length,
            rest,
        };
        (view, segments)
    }

    fn get(&self, lane: u32, index: u32) -> Option<&'a Block> {
        let (before, after) = self.rest.get(lane as usize)?;
        let start = self.slice * self.segment_length;
        let end = start + self.segment_length;
        if index < start {
            before.get(index as usize)
        } else if index >= end {
            after.get((index - end) as usize)
        } else {
            None
        }
    }
}

/// Data-independent address source for one segment.
struct AddressGenerator {
    input: Block,
    addresses: Block,
}

impl AddressGenerator {
    fn new(geometry: &Geometry, pos: Position) -> Self {
        let mut input = Block::ZERO;
        input.0[0] = pos.pass as u64;
        input.0[1] = pos.lane as u64;
        input.0[2] = pos.slice as u64;
        input.0[3] = geometry.memory_blocks as u64;
        input.0[4] = geometry.passes as u64;
        input.0[5] = geometry.variant as u64;
        Self {
            input,
            addresses: Block::ZERO,
        }
    }

    fn regenerate(&mut self) {
        self.input.0[6] += 1;
        let first = Block::compress(&Block::ZERO, &self.input);
        self.addresses = Block::compress(&Block::ZERO, &first);
    }
}

/// Fills `segment`, the blocks of lane `pos.lane` in slice `pos.slice`.
pub(super) fn fill_segment(
    geometry: &Geometry,
    view: &SliceView<'_>,
    segment: &mut [Block],
    pos: Position,
) -> Result<()> {
    geometry.check(pos)?;
    if segment.len() != geometry.segment_length as usize {
        return Err(Error::Kdf(format!(
            "segment holds {} blocks, expected {}",
            segment.len(),
            geometry.segment_length
        )));
    }

    let mut addresses = geometry
        .independent_addressing(pos)
        .then(|| AddressGenerator::new(geometry, pos));

    // the first two blocks of each lane come from H0
    let first = if pos.pass == 0 && pos.slice == 0 { 2 } else { 0 };
    let seg_start = pos.slice * geometry.segment_length;

    for i in first..geometry.segment_length {
        let index = seg_start + i;
        let prev_index = if index == 0 {
            geometry.lane_length - 1
        } else {
            index - 1
        };
        let prev = block_at(view, segment, pos.lane, seg_start, pos.lane, prev_index)?;

        let rand = match addresses.as_mut() {
            Some(generator) => {
                if i == first || i % ADDRESSES_IN_BLOCK == 0 {
                    generator.regenerate();
                }
                generator.addresses.0[(i % ADDRESSES_IN_BLOCK) as usize]
            }
            None => prev.0[0],
        };

        let ref_lane = if pos.pass == 0 && pos.slice == 0 {
            pos.lane
        } else {
            ((rand >> 32) % geometry.lanes as u64) as u32
        };
        let ref_index = reference_index(geometry, pos, i, rand as u32, ref_lane == pos.lane);
        let reference = block_at(view, segment, pos.lane, seg_start, ref_lane, ref_index)?;

        let next = Block::compress(prev, reference);
        let cell = &mut segment[i as usize];
        if pos.pass == 0 {
            *cell = next;
        } else {
            *cell ^= &next;
        }
    }
    Ok(())
}

fn block_at<'s>(
    view: &'s SliceView<'_>,
    segment: &'s [Block],
    own_lane: u32,
    seg_start: u32,
    lane: u32,
    index: u32,
) -> Result<&'s Block> {
    if lane == own_lane && index >= seg_start && index < seg_start + segment.len() as u32 {
        return Ok(&segment[(index - seg_start) as usize]);
    }
    view.get(lane, index).ok_or_else(|| {
        Error::Kdf(format!(
            "block {index} of lane {lane} is being written by another segment"
        ))
    })
}

/// Maps the low 32 bits of a pseudo-random value onto a previously written
/// block of the reference lane, biased towards recent blocks.
///
/// `index` is the position inside the current segment.
pub(super) fn reference_index(
    geometry: &Geometry,
    pos: Position,
    index: u32,
    rand: u32,
    same_lane: bool,
) -> u32 {
    let seg = geometry.segment_length;
    let back = u32::from(index == 0);
    let area: u32 = if pos.pass == 0 {
        if pos.slice == 0 {
            index - 1
        } else if same_lane {
            pos.slice * seg + index - 1
        } else {
            pos.slice * seg - back
        }
    } else if same_lane {
        geometry.lane_length - seg + index - 1
    } else {
        geometry.lane_length - seg - back
    };
    let area = area as u64;

    let x = (rand as u64 * rand as u64) >> 32;
    let relative = area - 1 - ((area * x) >> 32);
    let start = if pos.pass != 0 && pos.slice != SYNC_POINTS - 1 {
        ((pos.slice + 1) * seg) as u64
    } else {
        0
    };
    ((start + relative) % geometry.lane_length as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn geometry(lanes: u32, segment_length: u32) -> Geometry {
        Geometry {
            variant: Variant::Argon2d,
            passes: 3,
            lanes,
            lane_length: segment_length * SYNC_POINTS,
            segment_length,
            memory_blocks: segment_length * SYNC_POINTS * lanes,
        }
    }

    /// The reference must already hold data for this pass (pass 0) or must not
    /// be a block the current slice is still producing (later passes).
    fn assert_written(geo: &Geometry, pos: Position, i: u32, rand: u32, same_lane: bool) {
        let seg_start = pos.slice * geo.segment_length;
        let seg_end = seg_start + geo.segment_length;
        let r = reference_index(geo, pos, i, rand, same_lane);
        assert!(r < geo.lane_length);
        match (pos.pass, same_lane) {
            (0, true) => assert!(r < seg_start + i, "{pos:?} i={i} r={r}"),
            (0, false) => assert!(r < seg_start, "{pos:?} i={i} r={r}"),
            (_, true) => assert!(!(seg_start + i..seg_end).contains(&r), "{pos:?} i={i} r={r}"),
            (_, false) => assert!(!(seg_start..seg_end).contains(&r), "{pos:?} i={i} r={r}"),
        }
    }

    fn check_all_positions(geo: &Geometry, rand: u32) {
        for pass in 0..2 {
            for slice in 0..SYNC_POINTS {
                let pos = Position { pass, lane: 0, slice };
                let first = if pass == 0 && slice == 0 { 2 } else { 0 };
                for i in first..geo.segment_length {
                    assert_written(geo, pos, i, rand, true);
                    if !(pass == 0 && slice == 0) {
                        assert_written(geo, pos, i, rand, false);
                    }
                }
            }
        }
    }

    #[test]
    fn no_forward_reference_at_extremes() {
        for seg in [2, 3, 8, 33] {
            let geo = geometry(2, seg);
            for rand in [0, 1, 0x7fff_ffff, 0x8000_0000, 0xffff_fffe, u32::MAX] {
                check_all_positions(&geo, rand);
            }
        }
    }

    proptest! {
        #[test]
        fn no_forward_reference_random(rand in any::<u32>(), seg in 2u32..40) {
            check_all_positions(&geometry(4, seg), rand);
        }
    }

    #[test]
    fn reference_prefers_recent_blocks() {
        // rand = 0 gives the newest candidate, rand = MAX the oldest
        let geo = geometry(1, 8);
        let pos = Position { pass: 0, lane: 0, slice: 1 };
        assert_eq!(reference_index(&geo, pos, 3, 0, true), 8 + 3 - 2);
        assert_eq!(reference_index(&geo, pos, 3, u32::MAX, true), 0);
    }

    #[test]
    fn later_passes_wrap_around_lane() {
        let geo = geometry(1, 8);
        let pos = Position { pass: 1, lane: 0, slice: 1 };
        // window starts after the current segment and wraps
        assert_eq!(reference_index(&geo, pos, 0, u32::MAX, true), 16);
        let last = Position { pass: 1, lane: 0, slice: 3 };
        assert_eq!(reference_index(&geo, last, 0, u32::MAX, true), 0);
    }

    #[test]
    fn addressing_mode_per_variant() {
        let mut geo = geometry(1, 8);
        let early = Position { pass: 0, lane: 0, slice: 1 };
        let late = Position { pass: 0, lane: 0, slice: 2 };
        let second = Position { pass: 1, lane: 0, slice: 0 };

        geo.variant = Variant::Argon2i;
        assert!(geo.independent_addressing(late));
        geo.variant = Variant::Argon2d;
        assert!(!geo.independent_addressing(early));
        geo.variant = Variant::Argon2id;
        assert!(geo.independent_addressing(early));
        assert!(!geo.independent_addressing(late));
        assert!(!geo.independent_addressing(second));
    }

    #[test]
    fn invalid_position_fails() {
        let geo = geometry(2, 4);
        let mut memory = vec![Block::ZERO; geo.memory_blocks as usize];
        let (view, mut segments) = SliceView::split(&mut memory, &geo, 0);
        let segment = segments.remove(0);

        let pos = Position { pass: 5, lane: 0, slice: 0 };
        assert!(fill_segment(&geo, &view, &mut *segment, pos).is_err());
        let pos = Position { pass: 0, lane: 7, slice: 0 };
        assert!(fill_segment(&geo, &view, &mut *segment, pos).is_err());
        let pos = Position { pass: 0, lane: 0, slice: 4 };
        assert!(fill_segment(&geo, &view, &mut *segment, pos).is_err());
    }

    #[test]
    fn view_hides_segments_under_construction() {
        let geo = geometry(2, 4);
        let mut memory = vec![Block::ZERO; geo.memory_blocks as usize];
        let (view, segments) = SliceView::split(&mut memory, &geo, 1);
        assert_eq!(segments.len(), 2);
        assert!(view.get(1, 3).is_some());
        assert!(view.get(1, 4).is_none());
        assert!(view.get(1, 7).is_none());
        assert!(view.get(1, 8).is_some());
        assert!(view.get(2, 0).is_none());
    }
}

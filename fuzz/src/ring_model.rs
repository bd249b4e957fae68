use std::collections::VecDeque;

use vring_primitives::{HeapRegion, IndexRing, PushResult};

pub const MIN_CAPACITY: u32 = 1;
/// Small capacities hit wrap-around sooner.
pub const MAX_CAPACITY: u32 = 37;

#[derive(Debug, Clone, Copy)]
pub enum RingOp {
    Push(u32),
    Pop,
}

/// Map a fuzzer byte to a capacity, deliberately including non powers of two.
pub fn capacity_from(byte: u8) -> u32 {
    u32::from(byte) % (MAX_CAPACITY - MIN_CAPACITY + 1) + MIN_CAPACITY
}

/// Run `ops` against a ring and a `VecDeque`, failing on the first divergence.
pub fn execute_and_verify(capacity: u32, ops: &[RingOp]) -> Result<(), String> {
    let memory = HeapRegion::new_zeroed(IndexRing::<u32>::required_size(capacity));
    // SAFETY: the heap region is exclusively ours and large enough.
    let ring = unsafe { IndexRing::<u32>::init(memory.region(), 0, capacity) };
    let mut model = VecDeque::new();

    for (step, op) in ops.iter().enumerate() {
        match *op {
            RingOp::Push(value) => {
                let expect_full = model.len() == capacity as usize;
                match (ring.try_push(value), expect_full) {
                    (PushResult::Ok, false) => model.push_back(value),
                    (PushResult::WouldBlock, true) => {}
                    (got, _) => {
                        return Err(format!(
                            "step {step}: push {value} returned {got:?} with {} of {capacity} queued",
                            model.len()
                        ));
                    }
                }
            }
            RingOp::Pop => {
                let got = ring.try_pop();
                let want = model.pop_front();
                if got != want {
                    return Err(format!("step {step}: pop returned {got:?}, expected {want:?}"));
                }
            }
        }

        let status = ring.status();
        if status.len as usize != model.len() {
            return Err(format!(
                "step {step}: ring reports {} entries, model holds {}",
                status.len,
                model.len()
            ));
        }
        if status.len > capacity || status.tail > status.head {
            return Err(format!("step {step}: cursors out of bounds: {status}"));
        }
        if ring.is_full() != (model.len() == capacity as usize) {
            return Err(format!("step {step}: is_full disagrees with model"));
        }
    }
    Ok(())
}

//! Bolero harness for `IndexRing` push/pop against a `VecDeque`.
//!
//! Properties:
//! - FIFO order survives wrap-around at any capacity, power of two or not
//! - push fails exactly when the model is full
//! - `len <= capacity` and `tail <= head` after every operation

use bolero::check;
use vring_fuzz::ring_model::{RingOp, capacity_from, execute_and_verify};

fn main() {
    check!()
        .with_type::<(u8, Vec<(bool, u32)>)>()
        .for_each(|(capacity_byte, ops_data)| {
            let ops: Vec<RingOp> = ops_data
                .iter()
                .map(|(push, value)| if *push { RingOp::Push(*value) } else { RingOp::Pop })
                .collect();
            if let Err(e) = execute_and_verify(capacity_from(*capacity_byte), &ops) {
                panic!("ring diverged from model: {e}");
            }
        });
}

#[cfg(test)]
mod tests {
    use vring_fuzz::ring_model::{RingOp, execute_and_verify};

    #[test]
    fn fill_and_drain_odd_capacity() {
        let mut ops = Vec::new();
        for round in 0..4 {
            for i in 0..6 {
                ops.push(RingOp::Push(round * 10 + i));
            }
            for _ in 0..6 {
                ops.push(RingOp::Pop);
            }
        }
        execute_and_verify(5, &ops).unwrap();
    }

    #[test]
    fn capacity_one() {
        let ops = [
            RingOp::Pop,
            RingOp::Push(1),
            RingOp::Push(2),
            RingOp::Pop,
            RingOp::Push(3),
            RingOp::Pop,
            RingOp::Pop,
        ];
        execute_and_verify(1, &ops).unwrap();
    }
}

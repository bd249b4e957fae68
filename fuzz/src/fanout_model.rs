use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use vring::{Reader, ReaderConfig, Receipt, VringConfig, VringError, Writer};

pub const NUM_DESC: u32 = 4;
pub const MAX_READERS: u32 = 3;
const MSG_SIZE: u32 = 64;

#[derive(Debug, Clone, Copy)]
pub enum FanoutOp {
    Attach,
    Detach(u8),
    Publish,
    Take(u8),
    Release(u8),
}

impl FanoutOp {
    pub fn from_pair(kind: u8, arg: u8) -> Self {
        match kind % 5 {
            0 => FanoutOp::Attach,
            1 => FanoutOp::Detach(arg),
            2 => FanoutOp::Publish,
            3 => FanoutOp::Take(arg),
            _ => FanoutOp::Release(arg),
        }
    }
}

struct Subscriber {
    reader: Reader,
    /// Sequence numbers published to this reader and not taken yet.
    pending: VecDeque<u64>,
    /// Buffers taken and not released yet.
    held: Vec<Receipt>,
}

impl Subscriber {
    fn refs(&self) -> u64 {
        (self.pending.len() + self.held.len()) as u64
    }
}

fn fresh_topic() -> String {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    format!(
        "fanout-fuzz-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

fn pick(subscribers: &[Subscriber], arg: u8) -> Option<usize> {
    (!subscribers.is_empty()).then(|| arg as usize % subscribers.len())
}

/// Drive a live topic through `ops` and check descriptor accounting after
/// every step: nothing leaks, nothing is handed out twice, and each reader
/// sees exactly the messages published while it was attached.
pub fn execute_and_verify(ops: &[FanoutOp]) -> Result<(), String> {
    let topic = fresh_topic();
    let config = VringConfig::default()
        .with_msg_size(MSG_SIZE)
        .with_num_desc(NUM_DESC)
        .with_max_readers(MAX_READERS)
        .with_monitor_period(Duration::from_secs(3600));
    let writer = Writer::create(&topic, config).map_err(|e| format!("create: {e}"))?;
    let mut subscribers: Vec<Subscriber> = Vec::new();
    let mut seq = 0u64;

    let result = (|| {
        for (step, op) in ops.iter().enumerate() {
            match *op {
                FanoutOp::Attach => match Reader::open(&topic, ReaderConfig::default()) {
                    Ok(reader) => subscribers.push(Subscriber {
                        reader,
                        pending: VecDeque::new(),
                        held: Vec::new(),
                    }),
                    Err(VringError::NoReaderSlot)
                        if subscribers.len() == MAX_READERS as usize => {}
                    Err(e) => return Err(format!("step {step}: attach failed: {e}")),
                },
                FanoutOp::Detach(arg) => {
                    if let Some(i) = pick(&subscribers, arg) {
                        let gone = subscribers.swap_remove(i);
                        gone.reader
                            .close()
                            .map_err(|e| format!("step {step}: close failed: {e}"))?;
                    }
                }
                FanoutOp::Publish => {
                    let mut loan = match writer.get(Duration::ZERO) {
                        Ok(loan) => loan,
                        Err(VringError::TimedOut) => {
                            let refs: u64 = subscribers.iter().map(Subscriber::refs).sum();
                            if refs == 0 {
                                return Err(format!("step {step}: no free buffer yet none referenced"));
                            }
                            continue;
                        }
                        Err(e) => return Err(format!("step {step}: writer get failed: {e}")),
                    };
                    loan.as_mut_slice()[..8].copy_from_slice(&seq.to_le_bytes());
                    match writer.put(loan, 8) {
                        Ok(()) if !subscribers.is_empty() => {}
                        Err(VringError::NoReaders) if subscribers.is_empty() => {}
                        other => {
                            return Err(format!(
                                "step {step}: put with {} readers returned {other:?}",
                                subscribers.len()
                            ));
                        }
                    }
                    for sub in &mut subscribers {
                        sub.pending.push_back(seq);
                    }
                    seq += 1;
                }
                FanoutOp::Take(arg) => {
                    let Some(i) = pick(&subscribers, arg) else { continue };
                    let sub = &mut subscribers[i];
                    match sub.reader.get(Duration::ZERO) {
                        Ok(sample) => {
                            let got = u64::from_le_bytes(
                                sample.as_slice()[..8].try_into().map_err(|_| "short sample")?,
                            );
                            let want = sub.pending.pop_front();
                            if want != Some(got) {
                                return Err(format!("step {step}: got seq {got}, expected {want:?}"));
                            }
                            sub.held.push(sample.into_receipt());
                        }
                        Err(VringError::TimedOut) if sub.pending.is_empty() => {}
                        Err(e) => {
                            return Err(format!(
                                "step {step}: reader get failed with {} pending: {e}",
                                sub.pending.len()
                            ));
                        }
                    }
                }
                FanoutOp::Release(arg) => {
                    let Some(i) = pick(&subscribers, arg) else { continue };
                    let sub = &mut subscribers[i];
                    if let Some(receipt) = sub.held.pop() {
                        let index = receipt.index();
                        sub.reader
                            .release(receipt)
                            .map_err(|e| format!("step {step}: release of {index} failed: {e}"))?;
                    }
                }
            }

            let status = writer.status();
            let refs: u64 = subscribers.iter().map(Subscriber::refs).sum();
            if status.total_refs != refs {
                return Err(format!(
                    "step {step}: segment counts {} refs, model {refs}\n{status}",
                    status.total_refs
                ));
            }
            if status.in_flight != 0 || status.free + status.published != NUM_DESC {
                return Err(format!("step {step}: descriptors unaccounted for\n{status}"));
            }
            if status.attached_readers() != subscribers.len() {
                return Err(format!("step {step}: reader count mismatch\n{status}"));
            }
        }
        Ok(())
    })();

    drop(subscribers);
    drop(writer);
    result
}

use std::thread;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;
use vring::{Reader, ReaderConfig, VringConfig, VringError, Writer};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn topic(tag: &str) -> String {
    format!("transport-test-{}-{}", tag, std::process::id())
}

fn config(num_desc: u32, msg_size: u32, max_readers: u32) -> VringConfig {
    VringConfig::default()
        .with_num_desc(num_desc)
        .with_msg_size(msg_size)
        .with_max_readers(max_readers)
        // Tests that exercise recovery drive it explicitly.
        .with_monitor_period(Duration::from_secs(3600))
}

fn publish(writer: &Writer, payload: &[u8]) -> u32 {
    let mut loan = writer.get(WAIT).unwrap();
    loan.as_mut_slice()[..payload.len()].copy_from_slice(payload);
    let index = loan.index();
    writer.put(loan, payload.len()).unwrap();
    index
}

#[test]
fn hundred_sequential_messages_arrive_in_order() {
    init_tracing();
    let topic = topic("scenario-a");
    let writer = Writer::create(&topic, config(8, 128, 1)).unwrap();
    let reader = Reader::open(&topic, ReaderConfig::default()).unwrap();

    let producer = thread::spawn(move || {
        for seq in 0..100u8 {
            let mut msg = [0u8; 16];
            msg[0] = seq;
            publish(&writer, &msg);
        }
        writer
    });

    for expected in 0..100u8 {
        let sample = reader.get(WAIT).unwrap();
        assert_eq!(sample.len(), 16);
        assert_eq!(sample.as_slice()[0], expected);
        reader.put(sample).unwrap();
    }

    let writer = producer.join().unwrap();
    assert!(matches!(
        reader.get(Duration::ZERO),
        Err(VringError::TimedOut)
    ));
    assert_eq!(writer.status().free, 8);
}

#[test]
fn every_reader_sees_every_message() {
    init_tracing();
    let topic = topic("fanout");
    let writer = Writer::create(&topic, config(4, 64, 3)).unwrap();
    let readers: Vec<_> = (0..3)
        .map(|_| Reader::open(&topic, ReaderConfig::default()).unwrap())
        .collect();
    let mut slots: Vec<_> = readers.iter().map(Reader::slot).collect();
    slots.sort_unstable();
    assert_eq!(slots, vec![0, 1, 2]);

    for seq in 0..3u8 {
        publish(&writer, &[seq, seq, seq]);
    }

    for reader in &readers {
        for seq in 0..3u8 {
            let sample = reader.get(WAIT).unwrap();
            assert_eq!(sample.as_slice(), &[seq, seq, seq]);
            reader.put(sample).unwrap();
        }
    }
    assert_eq!(writer.status().free, 4);
}

#[test]
fn buffer_recycles_only_after_last_release() {
    init_tracing();
    let topic = topic("refcount");
    let writer = Writer::create(&topic, config(4, 64, 3)).unwrap();
    let readers: Vec<_> = (0..3)
        .map(|_| Reader::open(&topic, ReaderConfig::default()).unwrap())
        .collect();

    let index = publish(&writer, b"shared");
    let status = writer.status();
    assert_eq!(status.free, 3);
    assert_eq!(status.total_refs, 3);

    let mut taken: Vec<_> = readers.iter().map(|r| r.get(WAIT).unwrap()).collect();
    assert!(taken.iter().all(|s| s.index() == index && s.as_slice() == b"shared"));

    let last = taken.pop().unwrap();
    for (reader, sample) in readers.iter().zip(taken) {
        reader.put(sample).unwrap();
    }
    let status = writer.status();
    assert_eq!(status.free, 3);
    assert_eq!(status.total_refs, 1);

    readers[2].put(last).unwrap();
    assert_eq!(writer.status().free, 4);
    assert_eq!(writer.status().total_refs, 0);
}

#[test]
fn visible_length_matches_published_length() {
    init_tracing();
    let topic = topic("length");
    let writer = Writer::create(&topic, config(4, 128, 1)).unwrap();
    let reader = Reader::open(&topic, ReaderConfig::default()).unwrap();

    for len in [0usize, 1, 17, 128] {
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        publish(&writer, &payload);
        let sample = reader.get(WAIT).unwrap();
        assert_eq!(sample.len(), len);
        assert_eq!(sample.as_slice(), payload.as_slice());
        reader.put(sample).unwrap();
    }
}

#[test]
fn slow_reader_does_not_block_fast_reader() {
    init_tracing();
    let topic = topic("independent");
    let writer = Writer::create(&topic, config(8, 16, 2)).unwrap();
    let fast = Reader::open(&topic, ReaderConfig::default()).unwrap();
    let slow = Reader::open(&topic, ReaderConfig::default()).unwrap();

    for seq in 0..4u8 {
        publish(&writer, &[seq]);
        let sample = fast.get(WAIT).unwrap();
        assert_eq!(sample.as_slice(), &[seq]);
        fast.put(sample).unwrap();
    }
    // Each message is still referenced by the slow reader.
    assert_eq!(writer.status().free, 4);

    for seq in 0..4u8 {
        let sample = slow.get(WAIT).unwrap();
        assert_eq!(sample.as_slice(), &[seq]);
        slow.put(sample).unwrap();
    }
    assert_eq!(writer.status().free, 8);
}

#[test]
fn zero_readers_never_leak() {
    init_tracing();
    let writer = Writer::create(&topic("noleak"), config(4, 32, 2)).unwrap();

    for round in 0..20u32 {
        let a = writer.get(WAIT).unwrap();
        let b = writer.get(WAIT).unwrap();
        if round % 2 == 0 {
            assert!(matches!(writer.put(a, 4), Err(VringError::NoReaders)));
            writer.drop_buffer(b).unwrap();
        } else {
            writer.drop_buffer(a).unwrap();
            assert!(matches!(writer.put(b, 4), Err(VringError::NoReaders)));
        }
    }
    let status = writer.status();
    assert_eq!(status.free, 4);
    assert_eq!(status.in_flight, 0);
}

#[test]
fn claims_beyond_max_readers_fail_with_enospc() {
    init_tracing();
    let topic = topic("enospc");
    let _writer = Writer::create(&topic, config(2, 16, 2)).unwrap();
    let _a = Reader::open(&topic, ReaderConfig::default()).unwrap();
    let b = Reader::open(&topic, ReaderConfig::default()).unwrap();

    let err = Reader::open(&topic, ReaderConfig::default()).unwrap_err();
    assert!(matches!(err, VringError::NoReaderSlot));
    assert_eq!(err.errno(), libc::ENOSPC);

    drop(b);
    Reader::open(&topic, ReaderConfig::default()).unwrap();
}

#[test]
fn reader_requires_existing_topic() {
    init_tracing();
    let err = Reader::open(&topic("absent"), ReaderConfig::default()).unwrap_err();
    assert!(matches!(err, VringError::NotFound));
}

#[test]
fn reader_put_rejects_samples_from_other_readers() {
    init_tracing();
    let topic = topic("notheld");
    let writer = Writer::create(&topic, config(2, 16, 2)).unwrap();
    let mine = Reader::open(&topic, ReaderConfig::default()).unwrap();
    let other = Reader::open(&topic, ReaderConfig::default()).unwrap();

    let index = publish(&writer, b"x");
    let foreign = other.get(WAIT).unwrap();
    assert!(matches!(
        mine.put(foreign),
        Err(VringError::InvalidIndex { index: i }) if i == index
    ));
    // The rejected sample went back through its own reader.
    assert_eq!(writer.status().total_refs, 1);

    let sample = mine.get(WAIT).unwrap();
    mine.put(sample).unwrap();
    assert_eq!(writer.status().free, 2);
}

#[test]
fn receipts_keep_the_reference_until_released() {
    init_tracing();
    let topic = topic("receipt");
    let writer = Writer::create(&topic, config(2, 16, 2)).unwrap();
    let reader = Reader::open(&topic, ReaderConfig::default()).unwrap();
    let other = Reader::open(&topic, ReaderConfig::default()).unwrap();

    publish(&writer, b"keep");
    let receipt = reader.get(WAIT).unwrap().into_receipt();
    drop(other.get(WAIT).unwrap());
    assert_eq!(writer.status().total_refs, 1);

    reader.release(receipt).unwrap();
    assert_eq!(writer.status().free, 2);

    publish(&writer, b"again");
    let receipt = reader.get(WAIT).unwrap().into_receipt();
    assert!(matches!(
        other.release(receipt),
        Err(VringError::InvalidIndex { .. })
    ));
    // Still held by `reader` until it goes away.
    assert_eq!(writer.status().total_refs, 2);
    drop(other);
    drop(reader);
    assert_eq!(writer.status().free, 2);
}

#[test]
fn get_times_out_when_nothing_is_published() {
    init_tracing();
    let topic = topic("timeout");
    let _writer = Writer::create(&topic, config(2, 16, 1)).unwrap();
    let reader = Reader::open(&topic, ReaderConfig::default()).unwrap();

    let start = Instant::now();
    assert!(matches!(
        reader.get(Duration::from_millis(50)),
        Err(VringError::TimedOut)
    ));
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[test]
fn dropping_a_reader_releases_everything_it_had() {
    init_tracing();
    let topic = topic("shutdown");
    let writer = Writer::create(&topic, config(4, 16, 2)).unwrap();
    let stays = Reader::open(&topic, ReaderConfig::default()).unwrap();
    let leaves = Reader::open(&topic, ReaderConfig::default()).unwrap();

    for seq in 0..3u8 {
        publish(&writer, &[seq]);
    }
    // One held, two never consumed.
    let _held = leaves.get(WAIT).unwrap().into_receipt();
    leaves.close().unwrap();

    let status = writer.status();
    assert_eq!(status.attached_readers(), 1);
    assert_eq!(status.total_refs, 3);

    for _ in 0..3 {
        let sample = stays.get(WAIT).unwrap();
        stays.put(sample).unwrap();
    }
    assert_eq!(writer.status().free, 4);
}

#[test]
fn writer_drop_removes_the_topic() {
    init_tracing();
    let topic = topic("teardown");
    let writer = Writer::create(&topic, config(2, 16, 1)).unwrap();
    let reader = Reader::open(&topic, ReaderConfig::default()).unwrap();
    drop(reader);
    drop(writer);

    assert!(matches!(
        Reader::open(&topic, ReaderConfig::default()),
        Err(VringError::NotFound)
    ));
    Writer::create(&topic, config(2, 16, 1)).unwrap();
}

#[test]
fn inspect_reports_without_claiming() {
    init_tracing();
    let topic = topic("inspect");
    let writer = Writer::create(&topic, config(4, 16, 2)).unwrap();
    let _reader = Reader::open(&topic, ReaderConfig::default()).unwrap();
    publish(&writer, b"hi");

    let status = vring::inspect(&topic).unwrap();
    assert_eq!(status.shape.num_desc, 4);
    assert_eq!(status.free, 3);
    assert_eq!(status.published, 1);
    assert_eq!(status.attached_readers(), 1);
    let text = status.to_string();
    assert!(text.contains("3/4 free"), "{text}");
    assert!(text.contains("slot 0: ready"), "{text}");
}

use std::sync::Arc;

use conduit::{pipepair, CommandSink, LocalSink, Msg, PairConfig, Pipe, PipeEvents, PipeId};

#[derive(Default)]
struct Events {
    write_activated: usize,
    read_activated: usize,
}

impl PipeEvents for Events {
    fn read_activated(&mut self, _pipe: PipeId) {
        self.read_activated += 1;
    }

    fn write_activated(&mut self, _pipe: PipeId) {
        self.write_activated += 1;
    }
}

struct Pair {
    a: Pipe,
    b: Pipe,
    to_a: Arc<LocalSink>,
    to_b: Arc<LocalSink>,
    events_a: Events,
    events_b: Events,
}

impl Pair {
    fn new(config: PairConfig) -> Self {
        let to_a = Arc::new(LocalSink::new());
        let to_b = Arc::new(LocalSink::new());
        let (a, b) = pipepair(
            [
                Arc::clone(&to_a) as Arc<dyn CommandSink>,
                Arc::clone(&to_b) as Arc<dyn CommandSink>,
            ],
            config,
        );
        Self {
            a,
            b,
            to_a,
            to_b,
            events_a: Events::default(),
            events_b: Events::default(),
        }
    }

    fn deliver(&mut self) {
        for env in self.to_a.drain() {
            self.a
                .process_command(env.command, &mut self.events_a)
                .expect("a command");
        }
        for env in self.to_b.drain() {
            self.b
                .process_command(env.command, &mut self.events_b)
                .expect("b command");
        }
    }

    fn fill(&mut self) -> usize {
        let mut written = 0;
        while self.a.write(Msg::new(written.to_string())).is_ok() {
            written += 1;
        }
        self.a.flush();
        self.deliver();
        written
    }

    fn read_n(&mut self, n: usize) {
        for _ in 0..n {
            assert!(self.b.read().is_some(), "expected a message");
        }
        self.deliver();
    }
}

#[test]
fn writer_blocks_at_hwm_and_resumes_after_lwm_reads() {
    for hwm in [1u64, 2, 3, 4, 5, 7, 10, 64] {
        let lwm = (hwm as usize + 1) / 2;

        let mut pair = Pair::new(PairConfig::with_hwm(hwm));
        // Let b's reader fall asleep so the first flush wakes it.
        assert!(pair.b.read().is_none());
        assert_eq!(pair.fill(), hwm as usize, "hwm {hwm}");
        assert!(!pair.a.check_write());
        assert_eq!(pair.events_b.read_activated, 1);

        pair.read_n(lwm - 1);
        assert!(!pair.a.check_write(), "hwm {hwm}: {} reads resumed", lwm - 1);
        assert_eq!(pair.events_a.write_activated, 0);

        pair.read_n(1);
        assert_eq!(pair.events_a.write_activated, 1, "hwm {hwm}");
        assert!(pair.a.check_write(), "hwm {hwm}");
    }
}

#[test]
fn four_deep_pipe_reopens_after_two_reads() {
    let mut pair = Pair::new(PairConfig::with_hwm(4));
    assert_eq!(pair.a.hwm(), 4);
    assert_eq!(pair.b.lwm(), 2);

    for i in 0..4 {
        pair.a.write(Msg::new(vec![i])).expect("below hwm");
    }
    pair.a.flush();
    assert!(!pair.a.check_write());

    assert_eq!(pair.b.read().expect("first").data(), &[0]);
    pair.deliver();
    assert!(!pair.a.check_write());

    assert_eq!(pair.b.read().expect("second").data(), &[1]);
    pair.deliver();
    assert!(pair.a.check_write());

    // Two slots free now.
    pair.a.write(Msg::new(vec![4])).expect("slot");
    pair.a.write(Msg::new(vec![5])).expect("slot");
    assert!(pair.a.write(Msg::new(vec![6])).is_err());
}

#[test]
fn multipart_counts_once() {
    let mut pair = Pair::new(PairConfig::with_hwm(2));
    for _ in 0..2 {
        pair.a.write(Msg::more("h")).expect("part");
        pair.a.write(Msg::more("m")).expect("part");
        pair.a.write(Msg::new("t")).expect("part");
    }
    assert!(!pair.a.check_write());
    pair.a.flush();

    let parts: Vec<Msg> = std::iter::from_fn(|| pair.b.read()).collect();
    assert_eq!(parts.len(), 6);
    pair.deliver();
    assert!(pair.a.check_write());
}

#[test]
fn unbounded_pipe_never_refuses() {
    let mut pair = Pair::new(PairConfig::unbounded());
    for i in 0..10_000u32 {
        pair.a
            .write(Msg::new(i.to_le_bytes().to_vec()))
            .expect("unbounded");
    }
    pair.a.flush();
    let mut count = 0u32;
    while let Some(msg) = pair.b.read() {
        assert_eq!(msg.data(), &count.to_le_bytes());
        count += 1;
    }
    assert_eq!(count, 10_000);
    // No lwm, no acknowledgements.
    assert!(pair.to_a.is_empty());
}

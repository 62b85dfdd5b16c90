use std::sync::{mpsc, Arc};
use std::time::Duration;

use conduit::{Command, CommandSink, Envelope, Mailbox, PairConfig};

#[test]
fn send_from_other_thread_wakes_blocked_recv() -> conduit::Result<()> {
    let mailbox = Arc::new(Mailbox::new()?);
    let consumer = Arc::clone(&mailbox);

    let (started_tx, started_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    let handle = std::thread::spawn(move || -> conduit::Result<()> {
        let _ = started_tx.send(());
        let envelope = consumer.recv(Some(Duration::from_secs(5)))?;
        let _ = done_tx.send(envelope.map(|env| env.command));
        Ok(())
    });

    started_rx.recv().unwrap();
    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

    // Any pipe id works as an address; the mailbox does not route.
    let (pipe, _peer) = conduit::pipepair(
        [Arc::clone(&mailbox) as Arc<dyn CommandSink>, Arc::clone(&mailbox) as _],
        PairConfig::default(),
    );
    mailbox.send(Envelope {
        dest: pipe.id(),
        command: Command::ActivateWrite { msgs_read: 7 },
    });

    let received = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(
        received,
        Some(Command::ActivateWrite { msgs_read: 7 })
    ));
    handle.join().unwrap()?;
    Ok(())
}

#[test]
fn many_producers_keep_per_producer_order() -> conduit::Result<()> {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 2_000;

    let mailbox = Arc::new(Mailbox::new()?);
    let (pipe, _peer) = conduit::pipepair(
        [Arc::clone(&mailbox) as Arc<dyn CommandSink>, Arc::clone(&mailbox) as _],
        PairConfig::default(),
    );
    let dest = pipe.id();

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    mailbox.send(Envelope {
                        dest,
                        command: Command::ActivateWrite {
                            msgs_read: producer * PER_PRODUCER + seq,
                        },
                    });
                }
            })
        })
        .collect();

    let mut last = vec![None::<u64>; PRODUCERS as usize];
    let mut received = 0;
    while received < PRODUCERS * PER_PRODUCER {
        let Some(env) = mailbox.recv(Some(Duration::from_secs(5)))? else {
            panic!("mailbox stalled after {received} envelopes");
        };
        let Command::ActivateWrite { msgs_read } = env.command else {
            panic!("unexpected command");
        };
        let producer = (msgs_read / PER_PRODUCER) as usize;
        if let Some(prev) = last[producer] {
            assert!(msgs_read > prev, "producer {producer} reordered");
        }
        last[producer] = Some(msgs_read);
        received += 1;
    }

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(mailbox.try_recv()?.is_none());
    Ok(())
}

//! End-to-end event thread scenarios: cross-thread messaging, up/down
//! notifications, suspension, and loop watchers.

use evwheel::event::{
    message_send, timer_start, timer_stop, updown_up_subscribe, EventThreadBuilder, Timer,
};
use evwheel::test_utils::init_test_logging;
use evwheel::{test_complete, test_phase};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// S4: ten producers send 1000 messages each; the consumer observes all
/// 10 000 with every per-producer subsequence strictly increasing.
#[test]
fn s4_message_order_per_producer() {
    init_test("s4_message_order_per_producer");
    const PRODUCERS: u32 = 10;
    const PER_PRODUCER: u32 = 1000;
    const CONSUMER_ID: u32 = 10;

    let received: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let consumer = EventThreadBuilder::new("consumer", CONSUMER_ID)
        .message_cb(move |payload, _ctx| {
            let msg = *payload
                .downcast_ref::<(u32, u32)>()
                .expect("producer sends (producer, seq)");
            sink.lock().push(msg);
        })
        .build()
        .expect("build consumer");
    consumer.start(None).expect("start consumer");
    wait_until("consumer ready", Duration::from_secs(5), || consumer.ready());

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    message_send(CONSUMER_ID, Box::new((p, i))).expect("send");
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer");
    }

    wait_until("all messages", Duration::from_secs(10), || {
        received.lock().len() == (PRODUCERS * PER_PRODUCER) as usize
    });

    let received = received.lock();
    let mut last = vec![None::<u32>; PRODUCERS as usize];
    for &(p, i) in received.iter() {
        if let Some(prev) = last[p as usize] {
            assert!(i > prev, "producer {p}: {i} delivered after {prev}");
        }
        last[p as usize] = Some(i);
    }
    for (p, seen) in last.iter().enumerate() {
        assert_eq!(*seen, Some(PER_PRODUCER - 1), "producer {p} complete");
    }
    drop(received);

    consumer.stop().expect("stop");
    consumer.join().expect("join");
    test_complete!("s4_message_order_per_producer");
}

/// S5: a subscriber registered before the target goes up receives exactly
/// one UP notification; so does one registered after.
#[test]
fn s5_up_notifications_exactly_once() {
    init_test("s5_up_notifications_exactly_once");
    const EARLY_ID: u32 = 11;
    const TARGET_ID: u32 = 12;
    const LATE_ID: u32 = 13;

    let early_ups = Arc::new(AtomicU32::new(0));
    let early_arg_ok = Arc::new(AtomicBool::new(true));
    let ups = Arc::clone(&early_ups);
    let arg_ok = Arc::clone(&early_arg_ok);
    let early = EventThreadBuilder::new("early", EARLY_ID)
        .init_fn(move |_ctx| {
            // Subscribe before the target exists.
            updown_up_subscribe(TARGET_ID, move |peer| {
                ups.fetch_add(1, Ordering::SeqCst);
                if peer != TARGET_ID {
                    arg_ok.store(false, Ordering::SeqCst);
                }
            });
        })
        .build()
        .expect("build early");
    early.start(None).expect("start early");
    wait_until("early ready", Duration::from_secs(5), || early.ready());
    assert_eq!(early_ups.load(Ordering::SeqCst), 0, "target not up yet");

    let target = EventThreadBuilder::new("target", TARGET_ID)
        .build()
        .expect("build target");
    target.start(None).expect("start target");
    wait_until("early saw up", Duration::from_secs(5), || {
        early_ups.load(Ordering::SeqCst) == 1
    });
    assert!(early_arg_ok.load(Ordering::SeqCst), "callback argument is the peer id");

    // A subscriber registered after the target is up still gets one UP.
    let late_ups = Arc::new(AtomicU32::new(0));
    let ups = Arc::clone(&late_ups);
    let late = EventThreadBuilder::new("late", LATE_ID)
        .init_fn(move |_ctx| {
            updown_up_subscribe(TARGET_ID, move |_peer| {
                ups.fetch_add(1, Ordering::SeqCst);
            });
        })
        .build()
        .expect("build late");
    late.start(None).expect("start late");
    wait_until("late saw up", Duration::from_secs(5), || {
        late_ups.load(Ordering::SeqCst) == 1
    });

    // Settle and re-check: exactly once each.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(early_ups.load(Ordering::SeqCst), 1);
    assert_eq!(late_ups.load(Ordering::SeqCst), 1);

    for thread in [&early, &target, &late] {
        thread.stop().expect("stop");
        thread.join().expect("join");
    }
    test_complete!("s5_up_notifications_exactly_once");
}

/// Suspend parks the loop thread until resume; stop wakes a suspended
/// thread so it can exit.
#[test]
fn suspend_resume_stop_lifecycle() {
    init_test("suspend_resume_stop_lifecycle");
    const THREAD_ID: u32 = 14;

    let exited = Arc::new(AtomicBool::new(false));
    let exit_flag = Arc::clone(&exited);
    let thread = EventThreadBuilder::new("suspender", THREAD_ID)
        .exit_fn(move |_ctx| {
            exit_flag.store(true, Ordering::SeqCst);
        })
        .build()
        .expect("build");
    thread.start(None).expect("start");
    wait_until("ready", Duration::from_secs(5), || thread.ready());

    let hook_ran = Arc::new(AtomicBool::new(false));
    let hook_flag = Arc::clone(&hook_ran);
    thread
        .suspend_req(move || hook_flag.store(true, Ordering::SeqCst))
        .expect("suspend request");
    wait_until("suspended", Duration::from_secs(5), || thread.suspended());
    assert!(hook_ran.load(Ordering::SeqCst), "hook ran at the parking point");

    thread.resume_req();
    wait_until("resumed", Duration::from_secs(5), || !thread.suspended());

    // A second suspension is observed by stop(), which resumes the thread
    // so it can see the stop flag.
    thread.suspend_req(|| {}).expect("second suspend");
    wait_until("suspended again", Duration::from_secs(5), || thread.suspended());
    thread.stop().expect("stop");
    thread.join().expect("join");
    assert!(exited.load(Ordering::SeqCst), "exit hook ran");
    test_complete!("suspend_resume_stop_lifecycle");
}

/// Loop timers started from the thread's init hook fire on the loop.
#[test]
fn loop_timers_run_on_the_thread() {
    init_test("loop_timers_run_on_the_thread");
    const THREAD_ID: u32 = 15;

    let ticks = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&ticks);
    let thread = EventThreadBuilder::new("ticker", THREAD_ID)
        .init_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            let timer = Timer::new(0.01, 0.01, move |t| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 3 {
                    timer_stop(t);
                }
            });
            timer_start(&timer);
        })
        .build()
        .expect("build");
    thread.start(None).expect("start");

    wait_until("three ticks", Duration::from_secs(5), || {
        ticks.load(Ordering::SeqCst) >= 3
    });
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ticks.load(Ordering::SeqCst), 3, "stopped after three");

    thread.stop().expect("stop");
    thread.join().expect("join");
    test_complete!("loop_timers_run_on_the_thread");
}

extern crate core_affinity;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rs_splitref_stack;

use rs_splitref_stack::lockfree_stack::LockFreeStack;
use rs_splitref_stack::util;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;

#[repr(align(16))]
struct StackValue {
    value: i64,
}

struct GlobalControl {
    stack: LockFreeStack<StackValue>,
    loop_cnt: i64,
    producer_cnt: AtomicI64,
    produced: AtomicI64,
    consumed: AtomicI64,
    tol_val: AtomicI64,
}

fn set_cpu_affinity() {
    let cpus = core_affinity::get_core_ids().unwrap();
    core_affinity::set_for_current(cpus[util::get_thread_id() as usize % cpus.len()]);
    info!(
        "set_cpu_affinity {} {}",
        util::get_thread_id(),
        util::get_thread_id() as usize % cpus.len()
    );
}

fn consumer_thread(global_control: Arc<GlobalControl>) {
    set_cpu_affinity();
    let mut ret = false;
    let mut tol = 0;
    let mut tol_val = 0;
    loop {
        if let Some(v) = global_control.stack.try_pop() {
            tol_val += v.value;
            tol += 1;
            if tol % 1024 == 0 {
                global_control.consumed.fetch_add(tol, Ordering::Relaxed);
                global_control.tol_val.fetch_add(tol_val, Ordering::Relaxed);
                tol = 0;
                tol_val = 0;
            }
            ret = false;
        } else if global_control.producer_cnt.load(Ordering::SeqCst) == 0 {
            if ret {
                break;
            } else {
                ret = true;
            }
        }
    }
    global_control.consumed.fetch_add(tol, Ordering::Relaxed);
    global_control.tol_val.fetch_add(tol_val, Ordering::Relaxed);
}

fn producer_thread(global_control: Arc<GlobalControl>) {
    set_cpu_affinity();
    let mut tol = 0;
    for i in 0..global_control.loop_cnt {
        global_control.stack.push(StackValue { value: i });
        tol += 1;
        if i % 1024 == 0 {
            global_control.produced.fetch_add(tol, Ordering::Relaxed);
            tol = 0;
        }
    }
    global_control.produced.fetch_add(tol, Ordering::Relaxed);
    global_control.producer_cnt.fetch_sub(1, Ordering::SeqCst);
}

fn debug_thread(global_control: Arc<GlobalControl>) {
    while global_control.producer_cnt.load(Ordering::SeqCst) != 0 {
        info!(
            "debug_thread produced {} consumed {}",
            global_control.produced.load(Ordering::Relaxed),
            global_control.consumed.load(Ordering::Relaxed)
        );
        thread::sleep(time::Duration::from_millis(1000));
    }
}

fn main() {
    env_logger::init();

    let start = util::get_cur_microseconds_time();
    run_multi_threads();
    let cost = (util::get_cur_microseconds_time() - start) / 1000;
    println!("time cost {} ms", cost);
}

fn run_multi_threads() {
    let cpu_count = core_affinity::get_core_ids().unwrap().len().max(2) as i64;

    let producer_count = (cpu_count + 1) / 2;
    let consumer_count = cpu_count - producer_count;

    info!(
        "producer_count {} consumer_count {}",
        producer_count, consumer_count
    );

    let loop_cnt = 4_000_000 / producer_count;

    info!("loop_cnt {}, total need {}", loop_cnt, loop_cnt * producer_count);

    let global_control = Arc::new(GlobalControl {
        stack: LockFreeStack::new(),
        loop_cnt,
        producer_cnt: AtomicI64::new(producer_count),
        produced: AtomicI64::new(0),
        consumed: AtomicI64::new(0),
        tol_val: AtomicI64::new(0),
    });

    let mut producer_threads = vec![];
    let mut consumer_threads = vec![];

    let watch_thread = {
        let global_control = global_control.clone();
        thread::spawn(move || debug_thread(global_control))
    };

    for _ in 0..producer_count {
        let global_control = global_control.clone();
        producer_threads.push(thread::spawn(move || producer_thread(global_control)));
    }

    for _ in 0..consumer_count {
        let global_control = global_control.clone();
        consumer_threads.push(thread::spawn(move || consumer_thread(global_control)));
    }

    for t in producer_threads {
        t.join().unwrap();
    }

    info!("producer_threads joined");

    for t in consumer_threads {
        t.join().unwrap();
    }

    info!("consumer_threads joined");

    watch_thread.join().unwrap();

    let produced = global_control.produced.load(Ordering::SeqCst);
    let consumed = global_control.consumed.load(Ordering::SeqCst);
    info!("debug_thread produced {} consumed {}", produced, consumed);
    assert_eq!(
        global_control.tol_val.load(Ordering::SeqCst),
        producer_count * (loop_cnt - 1) * loop_cnt / 2
    );
    assert_eq!(produced, consumed);
}

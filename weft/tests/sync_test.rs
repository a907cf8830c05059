//! Cross-thread behavior of the synchronization primitives, including the
//! codec round trips that carry them between threads.

use std::thread;
use std::time::Duration;

use weft::{
    dehydrate, hydrate, Address, Barrier, ConditionVariable, Mutex, Semaphore, Value, WaitGroup,
};

#[test]
fn test_mutex_counter_is_exact() {
    // Two contenders, 300 lock/inc/unlock cycles each: the counter ends at
    // exactly 600 or mutual exclusion is broken.
    let mutex = Mutex::make().expect("make");
    let cell = Address::<i32>::alloc(1).expect("alloc");

    let contenders: Vec<_> = (0..2)
        .map(|_| {
            let mutex = mutex.clone();
            let cell = cell.clone();
            thread::spawn(move || {
                for _ in 0..300 {
                    assert!(mutex.lock(None).expect("worker thread may block"));
                    let v = cell.get(0);
                    cell.set(v + 1, 0);
                    mutex.unlock();
                }
            })
        })
        .collect();
    for contender in contenders {
        contender.join().expect("join");
    }
    assert_eq!(cell.get(0), 600);
}

#[tokio::test]
async fn test_condvar_observes_store() {
    // A writer takes the lock, stores 12, notifies; the async waiter loops
    // on the predicate until the store is visible.
    let mutex = Mutex::make().expect("make");
    let condvar = ConditionVariable::make().expect("make");
    let cell = Address::<i32>::alloc(1).expect("alloc");

    {
        let mutex = mutex.clone();
        let condvar = condvar.clone();
        let cell = cell.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            assert!(mutex.lock(None).expect("worker thread may block"));
            cell.atomic_store(12, 0);
            condvar.notify(1);
            mutex.unlock();
        });
    }

    assert!(mutex.lock_async(None).await.expect("async lock"));
    while cell.atomic_load(0) == 0 {
        assert!(condvar
            .wait_async(&mutex, Some(Duration::from_secs(10)))
            .await
            .expect("async wait"));
    }
    assert_eq!(cell.atomic_load(0), 12);
    mutex.unlock();
}

#[tokio::test]
async fn test_wait_group_converges() {
    // Four tasks contribute {4, 5, 6, 7}; after the wait resolves the sum
    // is complete.
    let group = WaitGroup::make().expect("make");
    let cell = Address::<i32>::alloc(1).expect("alloc");

    for n in [4, 5, 6, 7] {
        group.add(1);
        let group = group.clone();
        let cell = cell.clone();
        thread::spawn(move || {
            cell.atomic_add(n, 0);
            group.done();
        });
    }

    assert!(group
        .wait_async(Some(Duration::from_secs(10)))
        .await
        .expect("async wait"));
    assert_eq!(cell.atomic_load(0), 22);
}

#[tokio::test]
async fn test_barrier_cohort_of_three() {
    // Two contributors write before arriving; once the async waiter's epoch
    // opens, both contributions are visible.
    let barrier = Barrier::make(3).expect("make");
    let cell = Address::<i32>::alloc(1).expect("alloc");

    for _ in 0..2 {
        let barrier = barrier.clone();
        let cell = cell.clone();
        thread::spawn(move || {
            cell.atomic_add(1, 0);
            assert!(barrier
                .wait(Some(Duration::from_secs(10)))
                .expect("worker thread may block"));
        });
    }

    assert!(barrier
        .wait_async(Some(Duration::from_secs(10)))
        .await
        .expect("async wait"));
    assert_eq!(cell.atomic_load(0), 2);
}

#[test]
fn test_semaphore_serializes_increments() {
    // A one-permit semaphore makes four threads of 200 unlocked increments
    // sum exactly.
    let semaphore = Semaphore::make(1).expect("make");
    let cell = Address::<i32>::alloc(1).expect("alloc");

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let semaphore = semaphore.clone();
            let cell = cell.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    assert!(semaphore.acquire(None).expect("worker thread may block"));
                    let v = cell.get(0);
                    cell.set(v + 1, 0);
                    semaphore.release();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("join");
    }
    assert_eq!(cell.get(0), 800);
}

#[test]
fn test_round_trip_preserves_shared_state() {
    // A primitive that crosses the codec boundary still synchronizes with
    // the original instance.
    let mutex = Mutex::make().expect("make");
    let group = WaitGroup::make().expect("make");
    let semaphore = Semaphore::make(2).expect("make");
    let barrier = Barrier::make(2).expect("make");

    let message = dehydrate(Value::map([
        ("mutex", Value::from(mutex.clone())),
        ("group", Value::from(group.clone())),
        ("semaphore", Value::from(semaphore.clone())),
        ("barrier", Value::from(barrier.clone())),
    ]));
    let received = hydrate(message);

    let far_mutex: Mutex = received
        .get("mutex")
        .and_then(|v| v.shared_as())
        .expect("mutex");
    let far_group: WaitGroup = received
        .get("group")
        .and_then(|v| v.shared_as())
        .expect("group");
    let far_semaphore: Semaphore = received
        .get("semaphore")
        .and_then(|v| v.shared_as())
        .expect("semaphore");
    let far_barrier: Barrier = received
        .get("barrier")
        .and_then(|v| v.shared_as())
        .expect("barrier");

    // Mutex: state is the same word
    assert!(far_mutex.try_lock());
    assert!(!mutex.try_lock());
    far_mutex.unlock();

    // WaitGroup: counts accumulate across handles
    group.add(2);
    far_group.done();
    far_group.done();
    assert!(group
        .wait(Some(Duration::from_secs(1)))
        .expect("not on a runtime"));

    // Semaphore: capacity constant travels, permits are shared
    assert_eq!(far_semaphore.value(), 2);
    assert!(far_semaphore
        .acquire(Some(Duration::ZERO))
        .expect("not on a runtime"));
    assert_eq!(semaphore.held(), 1);
    far_semaphore.release();

    // Barrier: one arrival on each handle completes the cohort
    let arrival = thread::spawn(move || {
        far_barrier
            .wait(Some(Duration::from_secs(10)))
            .expect("worker thread may block")
    });
    assert!(barrier
        .wait(Some(Duration::from_secs(10)))
        .expect("not on a runtime"));
    assert!(arrival.join().expect("join"));
}

#[test]
fn test_timeouts_budget_wall_clock() {
    let mutex = Mutex::make().expect("make");
    assert!(mutex.try_lock());

    // A condvar wait that never gets notified burns its entire budget, not
    // more (generous upper bound to absorb slow CI).
    let condvar = ConditionVariable::make().expect("make");
    let started = std::time::Instant::now();
    let woke = condvar
        .wait(&mutex, Some(Duration::from_millis(100)))
        .expect("not on a runtime");
    assert!(!woke);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(5));
}

#[test]
fn test_round_trip_condvar_notifies_original_waiters() {
    let mutex = Mutex::make().expect("make");
    let condvar = ConditionVariable::make().expect("make");
    let cell = Address::<i32>::alloc(1).expect("alloc");

    let far_condvar: ConditionVariable = hydrate(dehydrate(Value::from(condvar.clone())))
        .shared_as()
        .expect("hydrated condvar");

    let waiter = {
        let mutex = mutex.clone();
        let condvar = condvar.clone();
        let cell = cell.clone();
        thread::spawn(move || {
            assert!(mutex.lock(None).expect("worker thread may block"));
            while cell.atomic_load(0) == 0 {
                assert!(condvar
                    .wait(&mutex, Some(Duration::from_secs(10)))
                    .expect("worker thread may block"));
            }
            mutex.unlock();
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(mutex.lock(None).expect("not on a runtime"));
    cell.atomic_store(1, 0);
    // The hydrated handle wakes waiters parked on the original
    far_condvar.notify_all();
    mutex.unlock();
    waiter.join().expect("join");
}

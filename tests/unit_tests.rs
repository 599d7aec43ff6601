#[cfg(test)]
mod tests {
    use task_dispatch::{
        errors::DispatchError,
        pool::Config,
        DispatcherInner, Done, Task, TaskState, Wait, WorkItem,
        CC_ERROR, CC_INVALID_FC, CC_NORMAL,
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn waited(fc: i32) -> (WorkItem, Arc<Wait>) {
        let wait = Wait::new();
        let done: Arc<dyn Done> = wait.clone();
        (WorkItem::new(fc).with_done(done), wait)
    }

    #[test]
    fn test_enqueue_and_wait() {
        println!("\n=== TEST: enqueue + Wait ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();
        let task = Task::echo("echo");

        let (item, wait) = waited(7);
        dispatcher.enqueue(&task, item).unwrap();
        assert_eq!(wait.wait(), CC_NORMAL);
        assert_eq!(task.state(), TaskState::Active);

        let item = wait.take().unwrap();
        assert_eq!(item.fc(), 7);
        assert_eq!(item.cc(), CC_NORMAL);
        println!("  ✓ item completed with CC_NORMAL");

        // Bound now, so the task forwards on its own.
        wait.reset();
        let done: Arc<dyn Done> = wait.clone();
        task.enqueue(WorkItem::new(8).with_done(done)).unwrap();
        assert_eq!(wait.wait(), CC_NORMAL);
        println!("  ✓ Task::enqueue forwards to the bound dispatcher");

        dispatcher.wait();
    }

    #[test]
    fn test_wrong_dispatcher_rejected() {
        println!("\n=== TEST: wrong dispatcher ===");
        init_logger();
        let first = DispatcherInner::new().unwrap();
        let second = DispatcherInner::new().unwrap();
        let task = Task::echo("bound");

        let (item, wait) = waited(1);
        first.enqueue(&task, item).unwrap();
        assert_eq!(wait.wait(), CC_NORMAL);

        let err = second.enqueue(&task, WorkItem::new(2)).unwrap_err();
        assert!(matches!(err.reason, DispatchError::WrongDispatcher { .. }));
        assert_eq!(err.into_item().fc(), 2);
        assert_eq!(second.metrics().rejected, 1);
        println!("  ✓ second dispatcher refused the task and returned the item");

        first.wait();
        drop(first);

        let (item, wait) = waited(3);
        second.enqueue(&task, item).unwrap();
        assert_eq!(wait.wait(), CC_NORMAL);
        println!("  ✓ task rebinds once its dispatcher is gone");

        second.wait();
    }

    #[test]
    fn test_chase_waits_for_prior_items() {
        println!("\n=== TEST: chase ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let task = Task::new("slow", move |item: WorkItem| {
            thread::sleep(Duration::from_millis(2));
            c.fetch_add(1, Ordering::SeqCst);
            item.post(CC_NORMAL);
        });

        for i in 0..10 {
            dispatcher.enqueue(&task, WorkItem::new(i)).unwrap();
        }
        assert_eq!(dispatcher.chase(&task).unwrap(), CC_NORMAL);
        assert_eq!(count.load(Ordering::SeqCst), 10);
        println!("  ✓ chase returned after all 10 items");

        dispatcher.trace(&task).unwrap();
        assert_eq!(dispatcher.chase(&task).unwrap(), CC_NORMAL);
        assert_eq!(task.processed(), 10);
        println!("  ✓ trace is not handed to work()");

        dispatcher.wait();
    }

    #[test]
    fn test_invalid_control_code() {
        println!("\n=== TEST: unknown control code ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();
        let task = Task::echo("invalid");

        let (item, wait) = waited(-42);
        dispatcher.enqueue(&task, item).unwrap();
        assert_eq!(wait.wait(), CC_INVALID_FC);
        assert_eq!(task.processed(), 0);
        println!("  ✓ fc -42 completed with CC_INVALID_FC");

        dispatcher.wait();
    }

    #[test]
    fn test_cancel_before_deadline() {
        println!("\n=== TEST: cancel before deadline ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();

        let start = Instant::now();
        let (item, wait) = waited(0);
        let token = dispatcher.delay(Duration::from_millis(200), item).unwrap();
        assert!(dispatcher.cancel(token));
        assert_eq!(wait.wait(), CC_ERROR);
        assert!(start.elapsed() < Duration::from_millis(200));
        println!("  ✓ cancelled in {:?}", start.elapsed());

        assert!(!dispatcher.cancel(token));
        println!("  ✓ second cancel finds nothing");

        dispatcher.wait();
    }

    #[test]
    fn test_cancel_after_fire() {
        println!("\n=== TEST: cancel after fire ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();

        let (item, wait) = waited(0);
        let token = dispatcher.delay(Duration::from_millis(100), item).unwrap();
        thread::sleep(Duration::from_millis(300));

        assert!(wait.is_complete());
        assert_eq!(wait.wait(), CC_NORMAL);
        assert!(!dispatcher.cancel(token));

        let timers = dispatcher.metrics().timers.unwrap();
        assert_eq!(timers.fired, 1);
        assert_eq!(timers.cancelled, 0);
        println!("  ✓ fired once, late cancel returned false");

        dispatcher.wait();
    }

    #[test]
    fn test_delays_fire_in_deadline_order() {
        println!("\n=== TEST: delay ordering ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let waits: Vec<_> = [60u64, 20, 40]
            .into_iter()
            .map(|ms| {
                let wait = Wait::new();
                let w = wait.clone();
                let o = order.clone();
                let done: Arc<dyn Done> = Arc::new(move |item: WorkItem| {
                    o.lock().push(ms);
                    w.on_done(item);
                });
                dispatcher.delay(Duration::from_millis(ms), WorkItem::new(0).with_done(done));
                wait
            })
            .collect();

        for wait in &waits {
            assert_eq!(wait.wait(), CC_NORMAL);
        }
        assert_eq!(*order.lock(), vec![20, 40, 60]);
        println!("  ✓ fired as 20, 40, 60");

        dispatcher.wait();
    }

    #[test]
    fn test_wait_is_idempotent() {
        println!("\n=== TEST: repeated wait ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();
        assert!(dispatcher.is_running());

        dispatcher.wait();
        dispatcher.wait();
        assert!(!dispatcher.is_running());
        assert!(!dispatcher.metrics().is_running());
        println!("  ✓ second wait is a no-op");
    }

    #[test]
    fn test_wait_finishes_queued_work() {
        println!("\n=== TEST: shutdown with work still queued ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..2)
            .map(|n| {
                let c = count.clone();
                Task::new(format!("busy-{n}"), move |item: WorkItem| {
                    thread::sleep(Duration::from_millis(5));
                    c.fetch_add(1, Ordering::SeqCst);
                    item.post(CC_NORMAL);
                })
            })
            .collect();

        let waits: Vec<_> = (0..50)
            .map(|i| {
                let (item, wait) = waited(i);
                dispatcher.enqueue(&tasks[i as usize % 2], item).unwrap();
                wait
            })
            .collect();

        let start = Instant::now();
        dispatcher.wait();
        assert_eq!(count.load(Ordering::SeqCst), 50);
        for wait in &waits {
            assert!(wait.is_complete());
            assert_eq!(wait.wait(), CC_NORMAL);
        }
        assert_eq!(tasks.iter().map(|t| t.processed()).sum::<usize>(), 50);
        println!("  ✓ 50 in-flight items finished inside wait() ({:?})", start.elapsed());
    }

    #[test]
    fn test_wait_forces_outstanding_delays() {
        println!("\n=== TEST: shutdown completes pending delays ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();

        let (item, wait) = waited(0);
        let token = dispatcher.delay(Duration::from_secs(60), item).unwrap();

        let start = Instant::now();
        dispatcher.wait();
        assert_eq!(wait.wait(), CC_NORMAL);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!dispatcher.cancel(token));
        println!("  ✓ 60s delay completed by wait()");
    }

    #[test]
    fn test_delay_after_wait_completes_now() {
        println!("\n=== TEST: delay after shutdown ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();
        dispatcher.wait();

        let (item, wait) = waited(0);
        assert!(dispatcher.delay(Duration::from_secs(10), item).is_none());
        assert!(wait.is_complete());
        assert_eq!(wait.wait(), CC_NORMAL);
        println!("  ✓ completed immediately without a token");
    }

    #[test]
    fn test_enqueue_after_wait_drains_inline() {
        println!("\n=== TEST: enqueue after shutdown ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();
        dispatcher.wait();

        let caller = thread::current().id();
        let ran_on = Arc::new(parking_lot::Mutex::new(None));
        let r = ran_on.clone();
        let task = Task::new("inline", move |item: WorkItem| {
            *r.lock() = Some(thread::current().id());
            item.post(CC_NORMAL);
        });

        let (item, wait) = waited(1);
        dispatcher.enqueue(&task, item).unwrap();
        assert!(wait.is_complete());
        assert_eq!(wait.wait(), CC_NORMAL);
        assert_eq!(*ran_on.lock(), Some(caller));
        assert_eq!(dispatcher.metrics().inline_drains, 1);
        println!("  ✓ drained on the calling thread");
    }

    #[test]
    fn test_prestarted_pool() {
        println!("\n=== TEST: Config::cpu_bound ===");
        init_logger();
        let config = Config {
            thread_name: "prestart".to_string(),
            ..Config::cpu_bound()
        };
        let dispatcher = DispatcherInner::with_config(config).unwrap();

        let pool = dispatcher.metrics().pool.unwrap();
        assert_eq!(pool.allocated_threads, num_cpus::get());
        assert_eq!(pool.spawned_threads, num_cpus::get());
        println!("  ✓ {} threads started up front", pool.allocated_threads);

        let task = Task::echo("reuse");
        for _ in 0..5 {
            let (item, wait) = waited(0);
            dispatcher.enqueue(&task, item).unwrap();
            assert_eq!(wait.wait(), CC_NORMAL);
        }
        assert_eq!(dispatcher.chase(&task).unwrap(), CC_NORMAL);
        let pool = dispatcher.metrics().pool.unwrap();
        assert!(pool.assignments >= 1 && pool.assignments <= 6);
        println!("  ✓ {} assignments, reuse {:.1}%", pool.assignments, pool.reuse_rate() * 100.0);

        dispatcher.wait();
        assert!(dispatcher.metrics().pool.is_none());
    }

    #[test]
    fn test_drop_from_pool_thread() {
        println!("\n=== TEST: last handle dropped inside a handler ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();
        let slot = Arc::new(parking_lot::Mutex::new(Some(dispatcher.clone())));
        let s = slot.clone();
        let task = Task::new("owner", move |item: WorkItem| {
            drop(s.lock().take());
            item.post(CC_NORMAL);
        });

        let (item, wait) = waited(0);
        dispatcher.enqueue(&task, item).unwrap();
        drop(dispatcher);
        assert_eq!(wait.wait(), CC_NORMAL);
        assert!(slot.lock().is_none());
        println!("  ✓ shutdown from a pool thread did not deadlock");
    }

    #[tokio::test]
    async fn test_chase_async() {
        println!("\n=== TEST: async chase ===");
        init_logger();
        let dispatcher = DispatcherInner::new().unwrap();
        let task = Task::echo("async");

        for i in 0..20 {
            dispatcher.enqueue(&task, WorkItem::new(i)).unwrap();
        }
        let item = dispatcher
            .chase_async(&task)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(item.cc(), CC_NORMAL);
        assert_eq!(task.processed(), 20);
        println!("  ✓ chase resolved after 20 items");

        dispatcher.wait();
    }
}

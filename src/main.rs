use clap::Parser;
use log::info;
use std::{
    sync::Arc,
    time::Instant,
};
use task_dispatch::{
    Config, DispatchError, Dispatcher, DispatcherInner, Done, Task, Wait, WorkItem,
    CC_ERROR, CC_NORMAL,
};


/// Pass-along stress driver: every item hops through a chain of tasks
/// before an echo task completes it.
#[derive(Parser, Debug)]
#[command(name = "dispatch-stress", version)]
struct Args {
    /// Rounds of traffic
    #[arg(short, long, default_value_t = 100)]
    loops: usize,

    /// Items in flight per round
    #[arg(short, long, default_value_t = 16)]
    multi: usize,

    /// Length of the pass-along chain
    #[arg(short, long, default_value_t = 8)]
    tasks: usize,

    /// Pool threads started up front
    #[arg(short, long, default_value_t = 0)]
    initial_threads: usize,
}


fn pass_along(name: String, dispatcher: &Dispatcher, next: Arc<Task>) -> Arc<Task> {
    let dispatcher = Arc::downgrade(dispatcher);
    Task::new(name, move |item: WorkItem| {
        let Some(dispatcher) = dispatcher.upgrade() else {
            item.post(CC_ERROR);
            return;
        };
        if let Err(e) = dispatcher.enqueue(&next, item) {
            log::error!("pass along failed: {}", e);
            e.into_item().post(CC_ERROR);
        }
    })
}


fn main() -> Result<(), DispatchError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = Config {
        initial_threads: args.initial_threads,
        ..Default::default()
    };
    let dispatcher = DispatcherInner::with_config(config)?;

    let mut head = Task::echo("echo");
    for n in (0..args.tasks).rev() {
        head = pass_along(format!("pass-{}", n), &dispatcher, head);
    }

    let now = Instant::now();
    let mut failed = 0usize;
    for _ in 0..args.loops {
        let waits: Vec<_> = (0..args.multi).map(|_| Wait::new()).collect();
        for wait in &waits {
            let done: Arc<dyn Done> = wait.clone();
            if let Err(e) = dispatcher.enqueue(&head, WorkItem::new(0).with_done(done)) {
                return Err(e.reason);
            }
        }
        failed += waits.iter().filter(|w| w.wait() != CC_NORMAL).count();
    }
    let elapsed = now.elapsed();

    let total = args.loops * args.multi;
    info!(
        "{} items through {} tasks in {:?} ({:.0} items/sec), {} failed",
        total,
        args.tasks + 1,
        elapsed,
        total as f64 / elapsed.as_secs_f64(),
        failed
    );
    dispatcher.debug();
    if let Some(pool) = dispatcher.metrics().pool {
        info!(
            "pool: allocated({}) spawned({}) reuse({:.1}%)",
            pool.allocated_threads,
            pool.spawned_threads,
            pool.reuse_rate() * 100.0
        );
    }

    dispatcher.wait();
    drop(dispatcher);
    Ok(())
}

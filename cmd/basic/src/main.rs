//! Basic evthread example
//!
//! Spawns a few event threads, schedules work onto them, runs a recurring
//! timer and echoes bytes through the I/O dispatcher.
//!
//! # Environment Variables
//!
//! - `EVT_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `EVT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use evthread::{kdebug, kinfo, kwarn};
use evthread::{schedule, AlertType, EvThread, HandlerMode, Interest, Subscription, TimerKind};

// EVT_LOG_LEVEL=debug EVT_FLUSH_EPRINT=1 cargo run -p evthread-basic
fn main() -> evthread::RtResult<()> {
    println!("=== evthread Basic Example ===\n");

    let rt = evthread::init()?;

    evthread::on_alert(Subscription::Only(AlertType::ThreadStall), |alert| {
        kwarn!("alert: {}", alert);
    })?;

    // Three workers, each just running its dispatch loop
    let workers = evthread::spawn_many("worker-", 3, |me| me.dispatch())?;
    let completed = Arc::new(AtomicUsize::new(0));

    for (i, w) in workers.iter().enumerate() {
        for j in 0..3 {
            let c = completed.clone();
            schedule(w, move || {
                kdebug!("[job {}.{}] on {}", i, j, EvThread::current().name());
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
    }

    // Recurring timer on the first worker; stops itself after 5 ticks
    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    evthread::add_timer(TimerKind::Recurring, Duration::from_millis(20), &workers[0], move |timer| {
        let n = t.fetch_add(1, Ordering::SeqCst) + 1;
        kdebug!("[tick {}] on {}", n, EvThread::current().name());
        if n == 5 {
            timer.destroy();
        }
    })?;

    // Echo through the I/O dispatcher
    let (mut client, server) = UnixStream::pair()?;
    server.set_nonblocking(true)?;
    let server_fd = server.as_raw_fd();
    let (echo_tx, echo_rx) = mpsc::channel();

    evthread::io_add(server_fd, Interest::READABLE, HandlerMode::MayBlock, Some(&workers[1]), move |ev| {
        let mut buf = [0u8; 64];
        let mut s = &server;
        match s.read(&mut buf) {
            Ok(n) if n > 0 => {
                let ctx = ev.target.as_ref().map_or("-", |t| t.name());
                kdebug!("[io] {} bytes on fd {} (context {})", n, ev.fd, ctx);
                let _ = echo_tx.send(buf[..n].to_vec());
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => kwarn!("[io] read failed: {}", e),
        }
    })?;

    let _ = client.write_all(b"hello evthread");
    match echo_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(data) => println!("I/O handler received: {}", String::from_utf8_lossy(&data)),
        Err(_) => println!("WARNING: no I/O event received"),
    }
    evthread::io_del(server_fd);

    // Wait for the jobs and the timer
    let start = Instant::now();
    let timeout = Duration::from_secs(10);
    while completed.load(Ordering::SeqCst) < 9 || ticks.load(Ordering::SeqCst) < 5 {
        if start.elapsed() > timeout {
            println!("WARNING: Timeout!");
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    kinfo!(
        "{} job(s) completed, {} timer tick(s)",
        completed.load(Ordering::SeqCst),
        ticks.load(Ordering::SeqCst)
    );
    println!("Jobs completed: {}", completed.load(Ordering::SeqCst));
    println!("Timer ticks:    {}", ticks.load(Ordering::SeqCst));
    println!("Timer stats:    {:?}", rt.timers().stats());
    println!("I/O stats:      {:?}", rt.io().stats());

    for w in &workers {
        w.kill_join();
    }
    rt.shutdown();

    println!("\n=== Example Complete ===");
    Ok(())
}

use sockmux::{
    AsyncSelect, DEFAULT_ID_BASE, Dispatch, Error, EventFlags, EventMask, Notification, Poster,
    RawFd, Socket, SocketEvent, SocketManager,
};
use sockmux::event::{NET_ACCEPT, NET_CLOSE, NET_CONNECT, NET_READ, NET_WRITE};

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Capability double that records every request.
#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<(RawFd, u32, EventMask)>>>,
    reenabled: Arc<Mutex<Vec<(RawFd, u32)>>>,
}

impl Recorder {
    fn calls(&self) -> Vec<(RawFd, u32, EventMask)> {
        self.calls.lock().unwrap().clone()
    }

    fn reenabled(&self) -> Vec<(RawFd, u32)> {
        self.reenabled.lock().unwrap().clone()
    }
}

impl AsyncSelect for Recorder {
    fn async_select(
        &self,
        fd: RawFd,
        _poster: &Poster,
        tag: u32,
        mask: EventMask,
    ) -> io::Result<()> {
        self.calls.lock().unwrap().push((fd, tag, mask));
        Ok(())
    }

    fn reenable(&self, fd: RawFd, event: u32) {
        self.reenabled.lock().unwrap().push((fd, event));
    }
}

/// Capability that re-posts every delivered notification, like a listener
/// whose callback never accepts.
#[derive(Clone, Default)]
struct Reposter {
    poster: Arc<Mutex<Option<(Poster, u32)>>>,
}

impl AsyncSelect for Reposter {
    fn async_select(
        &self,
        _fd: RawFd,
        poster: &Poster,
        tag: u32,
        _mask: EventMask,
    ) -> io::Result<()> {
        *self.poster.lock().unwrap() = Some((poster.clone(), tag));
        Ok(())
    }

    fn reenable(&self, fd: RawFd, event: u32) {
        if let Some((poster, tag)) = self.poster.lock().unwrap().as_ref() {
            let _ = poster.post(Notification::new(*tag, fd, event));
        }
    }
}

fn manager(capacity: usize) -> (SocketManager, Recorder) {
    let recorder = Recorder::default();
    let capability = recorder.clone();

    let manager = SocketManager::builder()
        .capacity(capacity)
        .resolver(move |_: Option<&str>| -> sockmux::Result<Box<dyn AsyncSelect>> {
            Ok(Box::new(capability.clone()))
        })
        .build()
        .expect("Failed to initialize manager");

    (manager, recorder)
}

fn fd(n: u32) -> RawFd {
    n as RawFd
}

fn record(socket: &Socket) -> Arc<Mutex<Vec<SocketEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    socket.on_state_change(move |event| sink.lock().unwrap().push(event));
    seen
}

#[test]
fn test_identifiers_unique_and_in_range() {
    let (manager, _) = manager(64);
    let sockets: Vec<_> = (0..64).map(|i| Socket::client(fd(i))).collect();

    let ids: HashSet<u32> = sockets
        .iter()
        .map(|s| manager.attach_socket(s).unwrap().tag())
        .collect();

    assert_eq!(ids.len(), 64);
    assert!(
        ids.iter()
            .all(|&tag| (DEFAULT_ID_BASE..DEFAULT_ID_BASE + 64).contains(&tag))
    );
    assert_eq!(manager.attached(), 64);
}

#[test]
fn test_capacity_overflow_fails_on_last_attempt() {
    let (manager, _) = manager(16);
    let sockets: Vec<_> = (0..17).map(|i| Socket::client(fd(i))).collect();

    let failures: Vec<usize> = sockets
        .iter()
        .enumerate()
        .filter(|(_, s)| manager.attach_socket(s).is_err())
        .map(|(i, _)| i)
        .collect();

    assert_eq!(failures, vec![16]);
    assert!(sockets[16].id().is_none());
    assert!(matches!(
        manager.attach_socket(&sockets[16]),
        Err(Error::RegistryFull { capacity: 16 })
    ));
}

#[test]
fn test_attach_twice_returns_same_id() {
    let (manager, _) = manager(4);
    let socket = Socket::client(fd(3));

    let first = manager.attach_socket(&socket).unwrap();
    let second = manager.attach_socket(&socket).unwrap();

    assert_eq!(first, second);
    assert_eq!(manager.attached(), 1);
}

#[test]
fn test_enable_requests_mask_by_role() {
    let (manager, recorder) = manager(4);

    let server = Socket::server(fd(10));
    let client = Socket::client(fd(11));
    let server_id = manager.attach_socket(&server).unwrap();
    let client_id = manager.attach_socket(&client).unwrap();

    manager.enable_notifications(&server).unwrap();
    manager.enable_notifications(&client).unwrap();

    assert_eq!(
        recorder.calls(),
        vec![
            (fd(10), server_id.tag(), EventMask::ACCEPT),
            (
                fd(11),
                client_id.tag(),
                EventMask::READ | EventMask::WRITE | EventMask::CONNECT | EventMask::CLOSE
            ),
        ]
    );
}

#[test]
fn test_disable_requests_empty_mask() {
    let (manager, recorder) = manager(4);
    let socket = Socket::client(fd(12));
    let id = manager.attach_socket(&socket).unwrap();

    manager.enable_notifications(&socket).unwrap();
    manager.disable_notifications(&socket).unwrap();

    assert_eq!(recorder.calls()[1], (fd(12), id.tag(), EventMask::NONE));
}

#[test]
fn test_invalid_descriptor_is_a_noop() {
    let (manager, recorder) = manager(4);
    let socket = Socket::client(fd(13));
    manager.attach_socket(&socket).unwrap();

    assert_eq!(socket.invalidate(), Some(fd(13)));
    manager.enable_notifications(&socket).unwrap();
    manager.disable_notifications(&socket).unwrap();

    assert!(recorder.calls().is_empty());
}

#[test]
fn test_enable_requires_attachment() {
    let (manager, recorder) = manager(4);
    let socket = Socket::client(fd(14));

    assert!(matches!(
        manager.enable_notifications(&socket),
        Err(Error::NotAttached)
    ));
    assert!(recorder.calls().is_empty());
}

#[test]
fn test_read_ready_delivers_input() {
    let (manager, _) = manager(4);
    let socket = Socket::client(fd(20));
    let seen = record(&socket);

    let id = manager.attach_socket(&socket).unwrap();
    manager.enable_notifications(&socket).unwrap();

    manager
        .poster()
        .post(Notification::new(id.tag(), fd(20), NET_READ))
        .unwrap();

    assert_eq!(manager.dispatch_pending(), 1);
    assert_eq!(*seen.lock().unwrap(), vec![SocketEvent::Input]);
    assert!(socket.detected().contains(EventFlags::INPUT));
}

#[test]
fn test_event_kinds_accumulate_until_lost() {
    let (manager, _) = manager(4);
    let socket = Socket::client(fd(21));
    let seen = record(&socket);
    let tag = manager.attach_socket(&socket).unwrap().tag();

    let poster = manager.poster();
    poster.post(Notification::new(tag, fd(21), NET_CONNECT)).unwrap();
    poster.post(Notification::new(tag, fd(21), NET_WRITE)).unwrap();
    poster.post(Notification::new(tag, fd(21), NET_READ)).unwrap();
    manager.dispatch_pending();

    assert_eq!(
        socket.detected(),
        EventFlags::CONNECTION | EventFlags::OUTPUT | EventFlags::INPUT
    );

    poster.post(Notification::new(tag, fd(21), NET_CLOSE)).unwrap();
    manager.dispatch_pending();

    assert_eq!(socket.detected(), EventFlags::LOST);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            SocketEvent::Connection,
            SocketEvent::Output,
            SocketEvent::Input,
            SocketEvent::Lost
        ]
    );
}

#[test]
fn test_failed_connect_is_lost() {
    let (manager, _) = manager(4);
    let socket = Socket::client(fd(22));
    let tag = manager.attach_socket(&socket).unwrap().tag();

    let outcome = manager.dispatch(Notification::new(tag, fd(22), NET_CONNECT).with_error(111));

    assert_eq!(outcome, Dispatch::Delivered(SocketEvent::Lost));
    assert_eq!(socket.detected(), EventFlags::LOST);
}

#[test]
fn test_clear_detected_acknowledges_flags() {
    let (manager, _) = manager(4);
    let socket = Socket::server(fd(23));
    let tag = manager.attach_socket(&socket).unwrap().tag();

    manager.dispatch(Notification::new(tag, fd(23), NET_ACCEPT));
    assert_eq!(socket.detected(), EventFlags::CONNECTION);

    socket.clear_detected(EventFlags::CONNECTION);
    assert!(socket.detected().is_empty());
}

#[test]
fn test_descriptor_mismatch_produces_no_callback() {
    let (manager, _) = manager(4);
    let socket = Socket::client(fd(30));
    let seen = record(&socket);
    let tag = manager.attach_socket(&socket).unwrap().tag();

    let outcome = manager.dispatch(Notification::new(tag, fd(31), NET_READ));

    assert_eq!(outcome, Dispatch::Dropped);
    assert!(seen.lock().unwrap().is_empty());
    assert!(socket.detected().is_empty());
}

#[test]
fn test_detach_purges_before_slot_reuse() {
    let (manager, _) = manager(1);

    let a = Socket::client(fd(40));
    let seen_a = record(&a);
    let x = manager.attach_socket(&a).unwrap();

    manager
        .poster()
        .post(Notification::new(x.tag(), fd(40), NET_READ))
        .unwrap();
    assert_eq!(manager.pending(), 1);

    manager.detach_socket(&a);
    assert!(a.id().is_none());
    assert_eq!(manager.pending(), 0);

    let b = Socket::client(fd(41));
    let seen_b = record(&b);
    assert_eq!(manager.attach_socket(&b).unwrap(), x);

    assert_eq!(manager.dispatch_pending(), 0);
    assert!(seen_a.lock().unwrap().is_empty());
    assert!(seen_b.lock().unwrap().is_empty());
}

#[test]
fn test_stale_notification_after_reuse_is_dropped() {
    let (manager, _) = manager(1);

    let a = Socket::client(fd(50));
    let x = manager.attach_socket(&a).unwrap();

    // Dequeued before the purge ran: only the descriptor check stands
    // between it and the new owner.
    let in_flight = Notification::new(x.tag(), fd(50), NET_READ);

    manager.detach_socket(&a);
    let b = Socket::client(fd(51));
    let seen_b = record(&b);
    assert_eq!(manager.attach_socket(&b).unwrap(), x);

    assert_eq!(manager.dispatch(in_flight), Dispatch::Dropped);
    assert!(seen_b.lock().unwrap().is_empty());
    assert!(b.detected().is_empty());
}

#[test]
fn test_detach_never_attached_socket() {
    let (manager, _) = manager(2);
    let attached = Socket::client(fd(60));
    let loose = Socket::client(fd(61));

    manager.attach_socket(&attached).unwrap();
    manager.detach_socket(&loose);
    manager.detach_socket(&loose);

    assert_eq!(manager.attached(), 1);
}

#[test]
fn test_dropped_socket_slot_is_reclaimed_with_purge() {
    let (manager, _) = manager(1);

    let a = Socket::client(fd(70));
    let x = manager.attach_socket(&a).unwrap();
    manager
        .poster()
        .post(Notification::new(x.tag(), fd(70), NET_READ))
        .unwrap();
    drop(a);

    let b = Socket::client(fd(70));
    let seen_b = record(&b);
    assert_eq!(manager.attach_socket(&b).unwrap(), x);

    assert_eq!(manager.dispatch_pending(), 0);
    assert!(seen_b.lock().unwrap().is_empty());
}

#[test]
fn test_foreign_tags_reach_default_handler() {
    let foreign = Arc::new(Mutex::new(Vec::new()));
    let sink = foreign.clone();

    let manager = SocketManager::builder()
        .capacity(4)
        .resolver(|_: Option<&str>| -> sockmux::Result<Box<dyn AsyncSelect>> {
            Ok(Box::new(Recorder::default()))
        })
        .default_handler(move |n: &Notification| sink.lock().unwrap().push(n.tag))
        .build()
        .unwrap();

    let poster = manager.poster();
    poster.post(Notification::new(0x0010, fd(1), 0)).unwrap();
    poster
        .post(Notification::new(DEFAULT_ID_BASE + 4, fd(1), NET_READ))
        .unwrap();
    poster.post(Notification::new(DEFAULT_ID_BASE, fd(1), NET_READ)).unwrap();

    assert_eq!(manager.dispatch_pending(), 3);
    assert_eq!(*foreign.lock().unwrap(), vec![0x0010, DEFAULT_ID_BASE + 4]);
}

#[test]
fn test_callback_can_detach_its_socket() {
    let manager = Arc::new(manager(4).0);
    let socket = Socket::client(fd(80));
    let tag = manager.attach_socket(&socket).unwrap().tag();

    let inner = manager.clone();
    let weak = Arc::downgrade(&socket);
    socket.on_state_change(move |event| {
        if event == SocketEvent::Lost {
            if let Some(socket) = weak.upgrade() {
                inner.detach_socket(&socket);
            }
        }
    });

    manager.dispatch(Notification::new(tag, fd(80), NET_CLOSE));

    assert!(socket.id().is_none());
    assert_eq!(manager.attached(), 0);
}

#[test]
fn test_pump_waits_for_posts_from_other_threads() {
    let (manager, _) = manager(4);
    let socket = Socket::client(fd(90));
    let seen = record(&socket);
    let tag = manager.attach_socket(&socket).unwrap().tag();

    assert_eq!(manager.pump(Duration::from_millis(10)), 0);

    let poster = manager.poster();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        poster.post(Notification::new(tag, fd(90), NET_READ)).unwrap();
    });

    let mut dispatched = 0;
    for _ in 0..100 {
        dispatched += manager.pump(Duration::from_millis(50));
        if dispatched > 0 {
            break;
        }
    }

    handle.join().expect("Thread panicked");
    assert_eq!(dispatched, 1);
    assert_eq!(*seen.lock().unwrap(), vec![SocketEvent::Input]);
}

#[test]
fn test_concurrent_attach_and_detach() {
    let (manager, _) = manager(32);
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let manager = manager.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    let socket = Socket::client(fd(t * 1000 + i));
                    let id = manager.attach_socket(&socket).expect("registry exhausted");
                    assert_eq!(socket.id(), Some(id));
                    manager.detach_socket(&socket);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    assert_eq!(manager.attached(), 0);
}

#[test]
fn test_shutdown_closes_everything() {
    let (manager, _) = manager(4);
    let socket = Socket::client(fd(100));
    manager.attach_socket(&socket).unwrap();
    let poster = manager.poster();

    manager.shutdown();
    manager.shutdown();

    assert!(manager.is_shut_down());
    assert_eq!(manager.attached(), 0);
    assert!(poster.is_closed());
    assert!(matches!(
        poster.post(Notification::new(DEFAULT_ID_BASE, fd(100), NET_READ)),
        Err(Error::ChannelClosed)
    ));
    assert!(matches!(
        manager.attach_socket(&Socket::client(fd(101))),
        Err(Error::ChannelClosed)
    ));
    assert!(manager.enable_notifications(&socket).is_err());
    assert_eq!(manager.pump(Duration::from_millis(10)), 0);

    // Detaching after shutdown only clears the socket's id.
    manager.detach_socket(&socket);
    assert!(socket.id().is_none());
}

#[test]
fn test_unresolvable_capability_fails_initialization() {
    let result = SocketManager::builder()
        .resolver(|_: Option<&str>| -> sockmux::Result<Box<dyn AsyncSelect>> {
            Err(Error::CapabilityUnavailable("not here".into()))
        })
        .build();

    assert!(matches!(result, Err(Error::CapabilityUnavailable(_))));
}

#[test]
fn test_library_name_reaches_resolver() {
    let requested = Arc::new(Mutex::new(None));
    let sink = requested.clone();

    let _manager = SocketManager::builder()
        .library("custom-net")
        .resolver(move |library: Option<&str>| -> sockmux::Result<Box<dyn AsyncSelect>> {
            *sink.lock().unwrap() = library.map(str::to_string);
            Ok(Box::new(Recorder::default()))
        })
        .build()
        .unwrap();

    assert_eq!(requested.lock().unwrap().as_deref(), Some("custom-net"));
}

#[test]
#[should_panic(expected = "capacity must be > 0")]
fn test_zero_capacity_panics() {
    let _ = SocketManager::builder().capacity(0);
}

#[test]
#[should_panic(expected = "exceeds")]
fn test_identifier_range_must_fit() {
    let _ = SocketManager::builder()
        .id_base(0x7000)
        .capacity(0x1000)
        .build();
}

#[test]
fn test_pump_without_deadline() {
    let (manager, _) = manager(4);
    let socket = Socket::client(fd(120));
    let seen = record(&socket);
    let tag = manager.attach_socket(&socket).unwrap().tag();

    manager
        .poster()
        .post(Notification::new(tag, fd(120), NET_READ))
        .unwrap();

    assert_eq!(manager.pump(Duration::MAX), 1);
    assert_eq!(*seen.lock().unwrap(), vec![SocketEvent::Input]);
}

#[test]
fn test_delivered_notifications_are_reenabled() {
    let (manager, recorder) = manager(4);
    let socket = Socket::server(fd(130));
    let tag = manager.attach_socket(&socket).unwrap().tag();

    manager.dispatch(Notification::new(tag, fd(130), NET_ACCEPT));
    manager.dispatch(Notification::new(tag, fd(131), NET_ACCEPT));
    manager.dispatch(Notification::new(DEFAULT_ID_BASE + 3, fd(130), NET_READ));

    // Only the delivered one; stale and unowned tags are left alone.
    assert_eq!(recorder.reenabled(), vec![(fd(130), NET_ACCEPT)]);

    manager.detach_socket(&socket);
    manager.dispatch(Notification::new(tag, fd(130), NET_ACCEPT));
    assert_eq!(recorder.reenabled().len(), 1);
}

#[test]
fn test_reposted_condition_waits_for_next_pass() {
    let capability = Reposter::default();
    let manager = SocketManager::builder()
        .capacity(4)
        .resolver(move |_: Option<&str>| -> sockmux::Result<Box<dyn AsyncSelect>> {
            Ok(Box::new(capability.clone()))
        })
        .build()
        .expect("Failed to initialize manager");

    let socket = Socket::server(fd(140));
    let seen = record(&socket);
    manager.attach_socket(&socket).unwrap();
    manager.enable_notifications(&socket).unwrap();

    let tag = socket.id().unwrap().tag();
    manager
        .poster()
        .post(Notification::new(tag, fd(140), NET_ACCEPT))
        .unwrap();

    assert_eq!(manager.dispatch_pending(), 1);
    assert_eq!(manager.pending(), 1);
    assert_eq!(manager.pump(Duration::from_millis(10)), 1);
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn test_detach_leaves_other_managers_queue_alone() {
    let (first, _) = manager(4);
    let (second, _) = manager(4);

    let ours = Socket::client(fd(150));
    let theirs = Socket::client(fd(151));
    let seen = record(&theirs);

    let id = first.attach_socket(&ours).unwrap();
    assert_eq!(second.attach_socket(&theirs).unwrap(), id);

    second
        .poster()
        .post(Notification::new(id.tag(), fd(151), NET_READ))
        .unwrap();

    // `ours` carries an id from `first`; `second` must not purge by it.
    second.detach_socket(&ours);

    assert!(ours.id().is_none());
    assert_eq!(second.pending(), 1);
    assert_eq!(second.attached(), 1);
    assert_eq!(first.attached(), 1);

    assert_eq!(second.dispatch_pending(), 1);
    assert_eq!(*seen.lock().unwrap(), vec![SocketEvent::Input]);
}

#[test]
fn test_dropped_socket_is_not_counted_as_attached() {
    let (manager, _) = manager(4);
    let kept = Socket::client(fd(160));
    let gone = Socket::client(fd(161));

    manager.attach_socket(&kept).unwrap();
    manager.attach_socket(&gone).unwrap();
    assert_eq!(manager.attached(), 2);

    drop(gone);
    assert_eq!(manager.attached(), 1);
}

//! Message queue scenarios: local delivery, locate and the remote transport

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dsplink::chnl::{ChannelAttrs, ChannelEngine, ChirpStatus};
use dsplink::drv::{LoopbackDriver, NullDriver};
use dsplink::msgq::msg::MsgHeader;
use dsplink::msgq::{
    MsgqAsyncError, MsgqErrorKind, MsgqLocateAttrs, MsgqStatus, PoolAllocator, PoolAttrs,
    RemoteAttrs, TransportAttrs,
};
use dsplink::osal::PrcsToken;
use dsplink::types::{ID_GPP, ID_MSGCHNL_FM_DSP, ID_MSGCHNL_TO_DSP};
use dsplink::{Link, LinkConfig, LinkError, MqaId, MqtId, MsgqId, ProcessorId, Timeout};

const P0: ProcessorId = ProcessorId(0);
const REPLY_Q: MsgqId = MsgqId(1);
const DSP_Q: MsgqId = MsgqId(5);

fn pools(num_msgs: usize) -> Arc<PoolAllocator> {
    Arc::new(PoolAllocator::new(&[PoolAttrs::new(64, num_msgs)]).unwrap())
}

/// Link with allocator 0, the local transport and a reply queue
fn local_link(driver: Arc<dyn dsplink::drv::LinkDriver>) -> (Link, PrcsToken, Arc<PoolAllocator>) {
    let link = Link::setup(LinkConfig::default(), driver).unwrap();
    let app = PrcsToken::create();
    link.attach(P0, &app).unwrap();
    let mqa = pools(8);
    link.msgq().allocator_open(&app, MqaId(0), mqa.clone()).unwrap();
    link.msgq()
        .transport_open(&app, MqtId(0), &TransportAttrs::Local)
        .unwrap();
    link.msgq().create(&app, REPLY_Q).unwrap();
    (link, app, mqa)
}

fn open_remote(link: &Link, app: &PrcsToken) {
    let attrs = RemoteAttrs::new(P0).with_num_bufs(4).with_max_msg_size(64);
    link.msgq()
        .transport_open(app, MqtId(1), &TransportAttrs::Remote(attrs))
        .unwrap();
}

#[test]
fn request_reply_on_the_gpp() {
    let (link, app, mqa) = local_link(Arc::new(NullDriver));
    let msgq = link.msgq();
    msgq.create(&app, MsgqId(2)).unwrap();
    msgq.locate(&app, ID_GPP, MsgqId(2), &MsgqLocateAttrs::new(Timeout::NoWait))
        .unwrap();

    let mut request = msgq.alloc(MqaId(0), 26).unwrap();
    request.body_mut().copy_from_slice(b"ping ping ping");
    msgq.put(ID_GPP, MsgqId(2), request, 0x100, REPLY_Q).unwrap();

    let request = msgq.get(MsgqId(2), Timeout::Forever).unwrap();
    let (proc_id, reply_to) = msgq.get_reply_id(&request).unwrap();
    assert_eq!((proc_id, reply_to), (ID_GPP, REPLY_Q));
    msgq.put(proc_id, reply_to, request, 0x101, MsgqId::INVALID).unwrap();

    let reply = msgq.get(REPLY_Q, Timeout::NoWait).unwrap();
    assert_eq!(reply.msg_id(), 0x101);
    assert_eq!(reply.body(), b"ping ping ping");
    assert_eq!(msgq.get_reply_id(&reply).unwrap_err(), LinkError::NotFound);
    msgq.free(reply).unwrap();
    assert_eq!(mqa.stats()[0].free, 8);
}

#[test]
fn locate_succeeds_after_concurrent_create() {
    let (link, app, _mqa) = local_link(Arc::new(NullDriver));
    let link = Arc::new(link);
    let attrs = MsgqLocateAttrs::new(Timeout::NoWait);

    assert_eq!(
        link.msgq().locate(&app, ID_GPP, MsgqId(9), &attrs).unwrap_err(),
        LinkError::NotFound
    );

    let creator = {
        let link = Arc::clone(&link);
        thread::spawn(move || {
            let owner = PrcsToken::create();
            link.msgq().create(&owner, MsgqId(9)).unwrap();
            owner
        })
    };
    let owner = creator.join().unwrap();
    link.msgq().locate(&app, ID_GPP, MsgqId(9), &attrs).unwrap();
    assert_eq!(link.msgq().msgq_owner(MsgqId(9)), Some(owner.id()));
}

#[test]
fn id_bounds_leave_no_owner() {
    let config = LinkConfig::default().with_num_mqas(1).with_num_mqts(1);
    let link = Link::setup(config, Arc::new(NullDriver)).unwrap();
    let app = PrcsToken::create();

    assert_eq!(
        link.msgq().allocator_open(&app, MqaId(1), pools(1)).unwrap_err(),
        LinkError::InvalidArgument("allocator id")
    );
    assert_eq!(
        link.msgq()
            .transport_open(&app, MqtId(1), &TransportAttrs::Local)
            .unwrap_err(),
        LinkError::InvalidArgument("transport id")
    );
    assert_eq!(link.msgq().allocator_owner(MqaId(1)), None);
    assert_eq!(link.msgq().transport_owner(MqtId(1)), None);
    assert_eq!(link.msgq().allocator_owner(MqaId(0)), None);
    assert_eq!(link.msgq().transport_owner(MqtId(0)), None);
}

#[test]
fn remote_locate_and_echo_over_loopback() {
    let driver = Arc::new(LoopbackDriver::new());
    driver.register_dsp_queue(P0, DSP_Q);
    let (link, app, mqa) = local_link(driver.clone());
    open_remote(&link, &app);
    let msgq = link.msgq();

    // The DSP answers asynchronously, so remote locates need a bounded wait
    let attrs = MsgqLocateAttrs::new(Timeout::Millis(2000));
    let short = MsgqLocateAttrs::new(Timeout::Millis(200));
    assert_eq!(msgq.locate(&app, P0, MsgqId(6), &short).unwrap_err(), LinkError::NotFound);
    assert_eq!(msgq.ldrv().status(P0, MsgqId(6)).unwrap(), MsgqStatus::Empty);

    // Never located: put is refused and the message comes back
    let msg = msgq.alloc(MqaId(0), 20).unwrap();
    let (err, msg) = msgq.put(P0, DSP_Q, msg, 0x10, REPLY_Q).unwrap_err();
    assert_eq!(err, LinkError::NotFound);

    msgq.locate(&app, P0, DSP_Q, &attrs).unwrap();
    assert_eq!(msgq.ldrv().status(P0, DSP_Q).unwrap(), MsgqStatus::InUse);

    let mut msg = msg;
    msg.body_mut().copy_from_slice(b"abcdefgh");
    msgq.put(P0, DSP_Q, msg, 0x10, REPLY_Q).unwrap();

    let echo = msgq.get(REPLY_Q, Timeout::Millis(2000)).unwrap();
    assert_eq!(echo.msg_id(), 0x10);
    assert_eq!(echo.body(), b"abcdefgh");
    assert_eq!(msgq.get_reply_id(&echo).unwrap(), (P0, DSP_Q));
    msgq.free(echo).unwrap();
    assert_eq!(mqa.stats()[0].free, 8);

    msgq.release(&app, P0, DSP_Q).unwrap();
    assert_eq!(msgq.ldrv().status(P0, DSP_Q).unwrap(), MsgqStatus::Empty);
    msgq.transport_close(&app, MqtId(1)).unwrap();
    assert!(!link.engine().is_open(P0, ID_MSGCHNL_TO_DSP));
    assert!(!link.engine().is_open(P0, ID_MSGCHNL_FM_DSP));
}

#[test]
fn remote_locate_retries_until_dsp_queue_appears() {
    let driver = Arc::new(LoopbackDriver::new());
    let (link, app, _mqa) = local_link(driver.clone());
    open_remote(&link, &app);

    let registrar = {
        let driver = Arc::clone(&driver);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            driver.register_dsp_queue(P0, MsgqId(7));
        })
    };
    link.msgq()
        .locate(&app, P0, MsgqId(7), &MsgqLocateAttrs::new(Timeout::Millis(5000)))
        .unwrap();
    registrar.join().unwrap();
    assert_eq!(link.msgq().locator_count(P0, MsgqId(7)), 1);
}

#[test]
fn remote_open_rolls_back_on_failure() {
    let (link, app, _mqa) = local_link(Arc::new(NullDriver));
    // Something already holds the receive channel
    link.engine()
        .open(P0, ID_MSGCHNL_FM_DSP, &ChannelAttrs::input(1))
        .unwrap();

    let attrs = RemoteAttrs::new(P0).with_max_msg_size(64);
    assert!(link
        .msgq()
        .transport_open(&app, MqtId(1), &TransportAttrs::Remote(attrs))
        .is_err());
    assert!(!link.engine().is_open(P0, ID_MSGCHNL_TO_DSP));
    assert_eq!(link.msgq().transport_owner(MqtId(1)), None);
}

/// Write `frame` into the oldest receive buffer and complete it
fn inject(engine: &ChannelEngine, frame: &[u8]) {
    let chirp = engine
        .get_request_chirp(P0, ID_MSGCHNL_FM_DSP)
        .unwrap()
        .expect("receive buffer primed");
    engine
        .with_request_chirp(P0, ID_MSGCHNL_FM_DSP, chirp, |c| {
            c.buffer_mut()[..frame.len()].copy_from_slice(frame);
            c.set_size(frame.len());
        })
        .unwrap();
    engine
        .add_io_completion(P0, ID_MSGCHNL_FM_DSP, chirp, ChirpStatus::COMPLETE)
        .unwrap();
}

fn dsp_frame(dst: MsgqId, msg_id: u16) -> Vec<u8> {
    let header = MsgHeader {
        size: 20,
        mqa_id: MqaId(0),
        src_proc: P0,
        src_msgq: DSP_Q,
        dst_msgq: dst,
        msg_id,
    };
    let mut frame = vec![0xAB; 20];
    header
        .encode(dsplink::chnl::Endianism::Default, &mut frame)
        .unwrap();
    frame
}

#[test]
fn incoming_messages_and_allocator_exhaustion() {
    let (link, app, mqa) = local_link(Arc::new(NullDriver));
    open_remote(&link, &app);
    let msgq = link.msgq();

    // Error notifications come from their own allocator
    msgq.allocator_open(&app, MqaId(1), pools(2)).unwrap();
    msgq.create(&app, MsgqId(0)).unwrap();
    msgq.set_error_handler(&app, MsgqId(0), MqaId(1)).unwrap();

    inject(link.engine(), &dsp_frame(REPLY_Q, 0x55));
    let msg = msgq.get(REPLY_Q, Timeout::Millis(2000)).unwrap();
    assert_eq!(msg.msg_id(), 0x55);
    assert!(msg.body().iter().all(|b| *b == 0xAB));
    msgq.free(msg).unwrap();

    // Hold every buffer of allocator 0 so the next arrival cannot be copied in
    let held: Vec<_> = (0..8).map(|_| msgq.alloc(MqaId(0), 20).unwrap()).collect();
    assert_eq!(mqa.stats()[0].free, 0);
    inject(link.engine(), &dsp_frame(REPLY_Q, 0x56));

    let note = msgq.get(MsgqId(0), Timeout::Millis(2000)).unwrap();
    let error = MsgqAsyncError::decode(&note).unwrap();
    assert_eq!(error.kind, MsgqErrorKind::AllocatorFailure);
    assert_eq!(error.arg1, u32::from(P0.0));
    assert_eq!(error.arg2, u32::from(REPLY_Q.0));
    assert_eq!(msgq.count(REPLY_Q).unwrap(), 0);

    msgq.free(note).unwrap();
    for msg in held {
        msgq.free(msg).unwrap();
    }
}

#[test]
fn destroy_with_open_transports() {
    let driver = Arc::new(LoopbackDriver::new());
    let (link, app, _mqa) = local_link(driver);
    open_remote(&link, &app);
    let msg = link.msgq().alloc(MqaId(0), 16).unwrap();
    link.msgq().put(ID_GPP, REPLY_Q, msg, 1, MsgqId::INVALID).unwrap();
    link.destroy();
}

#[test]
fn remote_frames_are_sent_on_the_to_dsp_channel() {
    let (link, app, _mqa) = local_link(Arc::new(NullDriver));
    open_remote(&link, &app);
    let engine = link.engine();
    // A locate attempt with nobody answering times out after one attempt
    assert_eq!(
        link.msgq()
            .locate(&app, P0, DSP_Q, &MsgqLocateAttrs::new(Timeout::NoWait))
            .unwrap_err(),
        LinkError::Timeout
    );
    let chirp = engine.get_request_chirp(P0, ID_MSGCHNL_TO_DSP).unwrap().unwrap();
    let header = engine
        .with_request_chirp(P0, ID_MSGCHNL_TO_DSP, chirp, |c| {
            MsgHeader::decode(dsplink::chnl::Endianism::Default, c.data())
        })
        .unwrap()
        .unwrap();
    assert_eq!(header.dst_msgq, DSP_Q);
    assert_eq!(header.msg_id, dsplink::msgq::msg::MSGQ_LOCATE_MSGID);
}

#[test]
fn bounded_remote_locate_keeps_its_timeout() {
    let (link, app, _mqa) = local_link(Arc::new(NullDriver));
    open_remote(&link, &app);
    let msgq = link.msgq();

    let started = Instant::now();
    assert_eq!(
        msgq.locate(&app, P0, DSP_Q, &MsgqLocateAttrs::new(Timeout::Millis(20)))
            .unwrap_err(),
        LinkError::Timeout
    );
    assert!(started.elapsed() < Duration::from_millis(300), "took {:?}", started.elapsed());

    let started = Instant::now();
    assert_eq!(
        msgq.locate(&app, P0, MsgqId(6), &MsgqLocateAttrs::new(Timeout::NoWait))
            .unwrap_err(),
        LinkError::Timeout
    );
    assert!(started.elapsed() < Duration::from_millis(100), "took {:?}", started.elapsed());
    assert_eq!(msgq.locator_count(P0, DSP_Q), 0);
}

#[test]
fn concurrent_manager_calls_across_tables() {
    let (link, app, mqa) = local_link(Arc::new(NullDriver));
    let (link, app) = (Arc::new(link), Arc::new(app));
    link.msgq().create(&app, MsgqId(0)).unwrap();

    let allocators = {
        let link = Arc::clone(&link);
        let app = Arc::clone(&app);
        thread::spawn(move || {
            for _ in 0..500 {
                link.msgq().allocator_open(&app, MqaId(1), pools(2)).unwrap();
                link.msgq().allocator_close(&app, MqaId(1)).unwrap();
            }
        })
    };
    let queues = {
        let link = Arc::clone(&link);
        let app = Arc::clone(&app);
        thread::spawn(move || {
            for _ in 0..500 {
                link.msgq().create(&app, MsgqId(3)).unwrap();
                let msg = link.msgq().alloc(MqaId(0), 16).unwrap();
                link.msgq().put(ID_GPP, MsgqId(3), msg, 1, MsgqId::INVALID).unwrap();
                link.msgq().delete(&app, MsgqId(3)).unwrap();
            }
        })
    };
    for _ in 0..500 {
        let _ = link.msgq().set_error_handler(&app, MsgqId(0), MqaId(1));
        let _ = link.msgq().set_error_handler(&app, MsgqId(3), MqaId(0));
    }
    allocators.join().unwrap();
    queues.join().unwrap();

    // Every pool buffer came home and no stale handler survived its queue
    assert_eq!(mqa.stats()[0].free, 8);
    assert_eq!(link.msgq().allocator_owner(MqaId(1)), None);
    assert_eq!(link.msgq().msgq_owner(MsgqId(3)), None);
    link.msgq().set_error_handler(&app, MsgqId::INVALID, MqaId(0)).unwrap();
}

#[test]
fn reserved_message_ids_are_not_delivered() {
    let (link, app, mqa) = local_link(Arc::new(NullDriver));
    open_remote(&link, &app);
    let msgq = link.msgq();

    inject(link.engine(), &dsp_frame(REPLY_Q, 0xFF07));
    inject(link.engine(), &dsp_frame(REPLY_Q, 0x57));

    let msg = msgq.get(REPLY_Q, Timeout::Millis(2000)).unwrap();
    assert_eq!(msg.msg_id(), 0x57);
    assert_eq!(msgq.count(REPLY_Q).unwrap(), 0);
    msgq.free(msg).unwrap();
    assert_eq!(mqa.stats()[0].free, 8);
}

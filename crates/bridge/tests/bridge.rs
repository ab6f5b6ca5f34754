//! The blocking worker-to-main protocol over the transfer buffer.

use anyhow::Result;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;
use wasmbridge_abi::{ty, CallContext, FlatValue, FuncType, Memory, Trap, Val};
use wasmbridge_bridge::{
    MainDispatcher, Message, ResultTag, TransferBuffer, WorkerConnection, HEADER_SIZE, LOCK_DONE,
    NEXT_FREE_OFFSET,
};
use wasmbridge_runtime::Callable;

fn cx() -> CallContext {
    drop(env_logger::try_init());
    CallContext::default()
}

/// Runs a single-message main loop on its own thread.
fn serve_one(
    dispatcher: Arc<MainDispatcher>,
    header: Arc<TransferBuffer>,
    from_worker: std::sync::mpsc::Receiver<Message>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        if let Ok(Message::CallMain {
            name,
            params,
            memory,
        }) = from_worker.recv()
        {
            dispatcher.dispatch(&name, &params, &memory, &header);
        }
    })
}

#[test]
fn doubling_round_trip_through_the_header() -> Result<()> {
    let cx = cx();
    let buffer = TransferBuffer::new(4096);
    let (to_main, from_worker) = channel();
    let connection = WorkerConnection::new(
        0,
        buffer.clone(),
        None,
        to_main,
        Some(Duration::from_secs(5)),
    );

    let func = Arc::new(FuncType::new("x", [("n", ty::u32())], Some(ty::u32())));
    let dispatcher = Arc::new(MainDispatcher::new(CallContext::default()));
    dispatcher.on_sync("x", &func, |_cx, _receiver, args| match args[0] {
        Val::U32(n) => Ok(Some(Val::U32(n * 2))),
        ref other => anyhow::bail!("unexpected argument {other:?}"),
    })?;
    let main = serve_one(dispatcher, buffer.clone(), from_worker);

    let callable = Callable::new(func, "x");
    let guest_memory = Memory::host();
    let returned = connection.call_main("x", &callable, &guest_memory, &[FlatValue::I32(7)], &cx)?;
    assert_eq!(returned, vec![FlatValue::I32(14)]);

    // The header holds the published protocol state.
    assert_eq!(buffer.lock_word(), LOCK_DONE);
    let (tag, bits) = buffer.result();
    assert_eq!(tag, ResultTag::Unsigned);
    assert_eq!(bits, 14);
    main.join().unwrap();
    Ok(())
}

#[test]
fn missing_handler_reports_its_error_code() -> Result<()> {
    let cx = cx();
    let buffer = TransferBuffer::new(4096);
    let (to_main, from_worker) = channel();
    let connection = WorkerConnection::new(
        0,
        buffer.clone(),
        None,
        to_main,
        Some(Duration::from_secs(5)),
    );

    let dispatcher = Arc::new(MainDispatcher::new(CallContext::default()));
    let main = serve_one(dispatcher, buffer.clone(), from_worker);

    let func = Arc::new(FuncType::new("absent", Vec::<(String, _)>::new(), None));
    let callable = Callable::new(func, "absent");
    let err = connection
        .call_main("absent", &callable, &Memory::host(), &[], &cx)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Trap>(),
        Some(Trap::NoHandler(name)) if name == "absent"
    ));
    main.join().unwrap();
    Ok(())
}

#[test]
fn handler_failure_becomes_a_rejection() -> Result<()> {
    let cx = cx();
    let buffer = TransferBuffer::new(4096);
    let (to_main, from_worker) = channel();
    let connection = WorkerConnection::new(
        0,
        buffer.clone(),
        None,
        to_main,
        Some(Duration::from_secs(5)),
    );

    let func = Arc::new(FuncType::new("boom", Vec::<(String, _)>::new(), None));
    let dispatcher = Arc::new(MainDispatcher::new(CallContext::default()));
    dispatcher.on_sync("boom", &func, |_cx, _receiver, _args| {
        anyhow::bail!("the host said no")
    })?;
    let main = serve_one(dispatcher, buffer.clone(), from_worker);

    let callable = Callable::new(func, "boom");
    let err = connection
        .call_main("boom", &callable, &Memory::host(), &[], &cx)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Trap>(),
        Some(Trap::Rejected(_))
    ));
    main.join().unwrap();
    Ok(())
}

#[test]
fn unanswered_call_times_out() {
    let cx = cx();
    let buffer = TransferBuffer::new(4096);
    let (to_main, _from_worker) = channel();
    let connection = WorkerConnection::new(
        0,
        buffer,
        None,
        to_main,
        Some(Duration::from_millis(50)),
    );

    let func = Arc::new(FuncType::new("slow", Vec::<(String, _)>::new(), None));
    let callable = Callable::new(func, "slow");
    let err = connection
        .call_main("slow", &callable, &Memory::host(), &[], &cx)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Trap>(),
        Some(Trap::CallTimedOut)
    ));
}

#[test]
fn string_parameters_cross_through_the_transfer_memory() -> Result<()> {
    let cx = cx();
    let buffer = TransferBuffer::new(4096);
    let (to_main, from_worker) = channel();
    let connection = WorkerConnection::new(
        0,
        buffer.clone(),
        None,
        to_main,
        Some(Duration::from_secs(5)),
    );

    let func = Arc::new(FuncType::new(
        "shout",
        [("text", ty::string())],
        Some(ty::u32()),
    ));
    let dispatcher = Arc::new(MainDispatcher::new(CallContext::default()));
    dispatcher.on_sync("shout", &func, |_cx, _receiver, args| {
        let text = args[0].as_str()?;
        assert_eq!(text, "über");
        Ok(Some(Val::U32(text.len() as u32)))
    })?;
    let main = serve_one(dispatcher, buffer.clone(), from_worker);

    // The guest lowered its string into its own memory; the bridge must
    // rehydrate it into the transfer buffer.
    let guest_memory = Memory::host();
    let mut flats = wasmbridge_abi::FlatValues::new();
    ty::string().lower_flat(&mut flats, &guest_memory, &Val::from("über"), &cx)?;

    let callable = Callable::new(func, "shout");
    let returned = connection.call_main("shout", &callable, &guest_memory, &flats, &cx)?;
    assert_eq!(returned, vec![FlatValue::I32(5)]);
    main.join().unwrap();
    Ok(())
}

#[test]
fn separate_data_buffer_carries_the_out_of_line_bytes() -> Result<()> {
    let cx = cx();
    let header = TransferBuffer::new(4096);
    let data = TransferBuffer::new(4096);
    let (to_main, from_worker) = channel();
    let connection = WorkerConnection::new(
        0,
        header.clone(),
        Some(data.clone()),
        to_main,
        Some(Duration::from_secs(5)),
    );

    let func = Arc::new(FuncType::new(
        "measure",
        [("text", ty::string())],
        Some(ty::u32()),
    ));
    let dispatcher = Arc::new(MainDispatcher::new(CallContext::default()));
    dispatcher.on_sync("measure", &func, |_cx, _receiver, args| {
        Ok(Some(Val::U32(args[0].as_str()?.len() as u32)))
    })?;
    let main = serve_one(dispatcher, header.clone(), from_worker);

    let guest_memory = Memory::host();
    let mut flats = wasmbridge_abi::FlatValues::new();
    ty::string().lower_flat(&mut flats, &guest_memory, &Val::from("abc"), &cx)?;

    let callable = Callable::new(func, "measure");
    let returned =
        connection.call_main("measure", &callable, &guest_memory, &flats, &cx)?;
    assert_eq!(returned, vec![FlatValue::I32(3)]);

    // Header buffer stays clean; the bytes landed in the data buffer.
    let header_view = header.memory().readonly(0, HEADER_SIZE);
    assert_eq!(header_view.get_u32(NEXT_FREE_OFFSET)?, HEADER_SIZE);
    let data_view = data.memory().readonly(0, HEADER_SIZE);
    assert!(data_view.get_u32(NEXT_FREE_OFFSET)? > HEADER_SIZE);
    main.join().unwrap();
    Ok(())
}

#[test]
fn async_handlers_complete_before_release() -> Result<()> {
    let cx = cx();
    let buffer = TransferBuffer::new(4096);
    let (to_main, from_worker) = channel();
    let connection = WorkerConnection::new(
        0,
        buffer.clone(),
        None,
        to_main,
        Some(Duration::from_secs(5)),
    );

    let func = Arc::new(FuncType::new("later", [("n", ty::u32())], Some(ty::u32())));
    let dispatcher = Arc::new(MainDispatcher::new(CallContext::default()));
    dispatcher.on_async("later", &func, |_cx, _receiver, args| {
        Box::pin(async move {
            match args[0] {
                Val::U32(n) => Ok(Some(Val::U32(n + 1))),
                ref other => anyhow::bail!("unexpected argument {other:?}"),
            }
        })
    })?;
    let main = serve_one(dispatcher, buffer.clone(), from_worker);

    let callable = Callable::new(func, "later");
    let returned =
        connection.call_main("later", &callable, &Memory::host(), &[FlatValue::I32(5)], &cx)?;
    assert_eq!(returned, vec![FlatValue::I32(6)]);
    main.join().unwrap();
    Ok(())
}

#[test]
fn sixty_four_bit_results_keep_their_range() -> Result<()> {
    let cx = cx();
    let buffer = TransferBuffer::new(4096);
    let (to_main, from_worker) = channel();
    let connection = WorkerConnection::new(
        0,
        buffer.clone(),
        None,
        to_main,
        Some(Duration::from_secs(5)),
    );

    let func = Arc::new(FuncType::new("big", Vec::<(String, _)>::new(), Some(ty::u64())));
    let dispatcher = Arc::new(MainDispatcher::new(CallContext::default()));
    dispatcher.on_sync("big", &func, |_cx, _receiver, _args| {
        Ok(Some(Val::U64(u64::MAX - 2)))
    })?;
    let main = serve_one(dispatcher, buffer.clone(), from_worker);

    let callable = Callable::new(func, "big");
    let returned = connection.call_main("big", &callable, &Memory::host(), &[], &cx)?;
    assert_eq!(returned, vec![FlatValue::I64(u64::MAX - 2)]);
    main.join().unwrap();
    Ok(())
}

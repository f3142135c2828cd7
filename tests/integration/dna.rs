use crate::*;

use terrace_core::buffers::ByteBufferOutput;
use terrace_core::dna::{
    DnaAction, DnaActions, DnaBatch, DnaCursor, DnaHeader, DnaValue, DnaWriter, ObjectStringSerializer,
};
use terrace_core::wire::MessageType;

/// A commit body: the string dictionary followed by the records that use it.
fn commit_message(pool: &ChunkPool, batch: DnaBatch<ObjectStringSerializer>) -> Result<WireMessage> {
    let (records, strings) = batch.into_parts();
    let mut body = ByteBufferOutput::new(pool);
    strings.serialize(&mut body)?;
    body.write_chunks(records.finalize());
    Ok(WireMessage::from_output(MessageType::CommitTransaction, body))
}

#[test]
fn object_record_survives_the_wire() -> Result<()> {
    init_tracing();
    let pool = ChunkPool::default();
    let mut batch = DnaBatch::new(ByteBufferOutput::new(&pool), ObjectStringSerializer::new());
    let mut writer = DnaWriter::new(&mut batch, DnaHeader::object(7, "Foo").with_version(3))?;
    writer.add_physical_action(&mut batch, "x", DnaValue::Int(42), false)?;
    writer.finalize_header(&mut batch)?;

    let received = transmit(commit_message(&pool, batch)?, &pool, 3)?;
    assert_eq!(received.len(), 1);
    let message = &received[0];
    assert_eq!(message.message_type()?, MessageType::CommitTransaction);

    let mut input = message.payload_input()?;
    let strings = ObjectStringSerializer::deserialize(&mut input)?;
    let mut cursor = DnaCursor::read(&mut input, &strings)?;
    assert_eq!(input.available(), 0);

    assert_eq!(cursor.object_id(), 7);
    assert_eq!(cursor.class_name(), Some("Foo"));
    assert_eq!(cursor.version(), Some(3));
    assert!(!cursor.is_delta());
    assert_eq!(cursor.action_count(), 1);
    assert_eq!(
        cursor.next_action()?,
        Some(DnaAction::Physical {
            field: "x".into(),
            value: DnaValue::Int(42),
            is_reference: false,
        })
    );
    assert_eq!(cursor.next_action()?, None);
    Ok(())
}

#[test]
fn interleaved_writers_replay_in_order() -> Result<()> {
    init_tracing();
    let pool = ChunkPool::default();
    let mut batch = DnaBatch::new(
        ByteBufferOutput::with_block_size(&pool, 8)?,
        ObjectStringSerializer::new(),
    );

    // Two records built side by side, then copied out one after the other.
    let mut first = DnaWriter::new(&mut batch, DnaHeader::delta(1))?;
    let mut second = DnaWriter::new(&mut batch, DnaHeader::object(2, "Bar"))?;
    first.add_logical_action(&mut batch, 4, vec![DnaValue::String("put".into())], Some(9))?;
    second.add_physical_action(&mut batch, "name", DnaValue::String("bar".into()), false)?;
    {
        let mut appender = first.create_appender();
        appender.add_meta_data(&mut batch, b"origin=client-1")?;
        appender.add_literal_value(&mut batch, DnaValue::Long(-5))?;
    }
    first.finalize_header(&mut batch)?;
    second.finalize_header(&mut batch)?;
    assert!(!first.is_contiguous());

    let mut out = DnaBatch::new(ByteBufferOutput::new(&pool), ObjectStringSerializer::new());
    first.copy_to(&batch, out.output_mut())?;
    second.copy_to(&batch, out.output_mut())?;
    let (records, _) = out.into_parts();
    let (_, strings) = batch.into_parts();

    let mut input = records.into_input();
    let mut one = DnaCursor::read(&mut input, &strings)?;
    let mut two = DnaCursor::read(&mut input, &strings)?;
    assert_eq!(input.available(), 0);

    assert!(one.is_delta());
    let actions = one.actions()?;
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[1], DnaAction::Literal(DnaValue::Long(-5)));
    assert_eq!(
        one.next_meta_data()?.as_deref(),
        Some(&b"origin=client-1"[..])
    );
    assert_eq!(two.class_name(), Some("Bar"));
    assert_eq!(two.actions()?.len(), 1);
    Ok(())
}

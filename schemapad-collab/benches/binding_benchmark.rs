use criterion::{black_box, criterion_group, criterion_main, Criterion};
use schemapad_collab::protocol::{AwarenessUpdate, PeerSelection, PeerState, SyncMessage};
use schemapad_collab::DocumentBinding;
use schemapad_core::{
    ContentChange, EditorView, HeadlessEditor, ReplicatedText, TextBuffer, TextModel,
};
use std::rc::Rc;

const SCHEMA: &str = "type Query {\n  products(first: Int): [Product!]!\n}\n\ntype Product {\n  id: ID!\n  name: String!\n}\n";

fn bound(content: &str) -> (ReplicatedText, Rc<TextBuffer>, Rc<HeadlessEditor>, DocumentBinding) {
    let text = ReplicatedText::new();
    text.insert(0, content).unwrap();
    let model = Rc::new(TextBuffer::new(""));
    let editor = Rc::new(HeadlessEditor::new(model.clone()));
    let editors: Vec<Rc<dyn EditorView>> = vec![editor.clone()];
    let binding = DocumentBinding::attach(text.clone(), model.clone(), editors, None);
    (text, model, editor, binding)
}

fn bench_local_keystroke(c: &mut Criterion) {
    let (_text, model, editor, _binding) = bound(SCHEMA);

    c.bench_function("binding_local_keystroke", |b| {
        b.iter(|| {
            editor.set_caret_offset(model.len());
            editor.type_text(black_box("x")).unwrap();
        })
    });
}

fn bench_local_multi_edit(c: &mut Criterion) {
    let (_text, model, _editor, _binding) = bound(SCHEMA);

    c.bench_function("binding_local_three_edits", |b| {
        b.iter(|| {
            model
                .apply_edits(black_box(&[
                    ContentChange::insert(0, "#"),
                    ContentChange::insert(20, "a"),
                    ContentChange::insert(40, "b"),
                ]))
                .unwrap();
        })
    });
}

fn bench_remote_update(c: &mut Criterion) {
    let (text, model, editor, _binding) = bound(SCHEMA);
    editor.set_caret_offset(model.len());
    let remote = ReplicatedText::from_snapshot(&text.encode_snapshot()).unwrap();

    c.bench_function("binding_remote_insert_with_caret", |b| {
        b.iter(|| {
            remote.insert(0, "y").unwrap();
            text.apply_update(black_box(&remote.encode_snapshot())).unwrap();
        })
    });
}

fn bench_update_message(c: &mut Criterion) {
    let update = vec![7u8; 64];

    c.bench_function("update_message_roundtrip_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(42), 1, black_box(update.clone()));
            let encoded = msg.encode().unwrap();
            black_box(SyncMessage::decode(&encoded).unwrap());
        })
    });
}

fn bench_awareness_message(c: &mut Criterion) {
    let text = ReplicatedText::new();
    text.insert(0, SCHEMA).unwrap();
    let anchor = text.relative_position(10).unwrap().to_bytes();
    let head = text.relative_position(20).unwrap().to_bytes();
    let mut state = PeerState::new("Quiet Otter", "#5bc0eb");
    state.selection = Some(PeerSelection { anchor, head });
    let update = AwarenessUpdate {
        clock: 3,
        state: Some(state),
    };

    c.bench_function("awareness_message_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(black_box(42), black_box(&update)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_local_keystroke,
    bench_local_multi_edit,
    bench_remote_update,
    bench_update_message,
    bench_awareness_message,
);
criterion_main!(benches);

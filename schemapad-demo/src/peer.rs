//! One simulated participant: a buffer, a headless editor and a session.

use std::rc::Rc;

use log::info;
use schemapad_collab::{
    CollabConfig, CollabResult, CollabSession, DocumentStore, LocalHub, Preferences,
    SessionManager, SessionParams,
};
use schemapad_core::{EditorView, HeadlessEditor, TextBuffer, TextModel};

pub struct DemoPeer<S: DocumentStore + 'static> {
    pub label: &'static str,
    pub model: Rc<TextBuffer>,
    pub editor: Rc<HeadlessEditor>,
    pub session: CollabSession<S>,
}

impl<S: DocumentStore + 'static> DemoPeer<S> {
    pub fn join(
        label: &'static str,
        hub: &Rc<LocalHub>,
        store: &Rc<S>,
        preferences: Rc<dyn Preferences>,
        config: &CollabConfig,
        params: &SessionParams,
        starting_content: &str,
    ) -> CollabResult<Self> {
        let manager = SessionManager::new(hub.clone(), store.clone(), preferences, config.clone());
        let model = Rc::new(TextBuffer::new(starting_content));
        let editor = Rc::new(HeadlessEditor::new(model.clone()));
        let editors: Vec<Rc<dyn EditorView>> = vec![editor.clone()];
        let session = manager.open(params.clone(), model.clone(), editors)?;
        info!("{label} joined as client {}", session.client_id());
        Ok(Self {
            label,
            model,
            editor,
            session,
        })
    }

    pub fn type_at(&self, offset: usize, text: &str) -> CollabResult<()> {
        self.editor.set_caret_offset(offset.min(self.model.len()));
        self.editor.type_text(text)?;
        Ok(())
    }

    pub fn append(&self, text: &str) -> CollabResult<()> {
        self.type_at(self.model.len(), text)
    }

    pub fn report(&self) {
        let roster = self.session.presence().roster();
        let viewer = roster.viewer.map(|v| v.name).unwrap_or_default();
        let others: Vec<String> = roster
            .collaborators
            .iter()
            .map(|c| format!("{} ({})", c.name, c.color))
            .collect();
        info!(
            "{}: viewer {viewer:?}, sees {} collaborator(s): {}",
            self.label,
            others.len(),
            others.join(", ")
        );
        for h in self.session.presence().highlights() {
            info!(
                "{}:   {} selects bytes {}..{}",
                self.label, h.name, h.start, h.end
            );
        }
        info!(
            "{}:   {} decoration(s), {} label(s), {} bytes",
            self.label,
            self.editor.decorations().len(),
            self.editor.widgets().len(),
            self.model.len()
        );
    }
}

//! Presence: who is in the room and where their selections are.
//!
//! ```text
//! Room change event
//!       │
//!       ▼
//! PresenceTracker::on_room_change
//!       ├─ rebuild roster (viewer + collaborators) ──► roster listeners
//!       ├─ install style rules for new client ids
//!       └─ render
//!            ├─ resolve each peer's anchor/head positions
//!            ├─ decorations: yRemoteSelection-{id} + head marker
//!            └─ content widgets: name tag above the range
//! ```
//!
//! The binding calls [`PresenceTracker::render_in`] after every text
//! change so highlights follow the content inside the same transaction.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use schemapad_core::{
    ContentWidget, Decoration, DecorationId, EditorId, EditorView, ListenerId, Listeners,
    RelativePosition, ReplicatedText, StyleRule, TextModel, WidgetPlacement,
};
use uuid::Uuid;
use yrs::ReadTxn;

use crate::protocol::{ClientId, PeerState};
use crate::transport::{update_local_state, AwarenessChange, Room};

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// A participant as shown in the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collaborator {
    pub id: ClientId,
    pub name: String,
    pub color: String,
}

/// The local participant and everybody else.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub viewer: Option<Collaborator>,
    /// Sorted by client id.
    pub collaborators: Vec<Collaborator>,
}

/// A remote selection resolved to byte offsets in the local buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHighlight {
    pub client_id: ClientId,
    pub name: String,
    pub color: String,
    pub start: usize,
    pub end: usize,
    /// Caret sits at `start` (backward selection or empty range).
    pub head_at_start: bool,
}

// ───────────────────────────────────────────────────────────────────
// Colours and names
// ───────────────────────────────────────────────────────────────────

/// A random, vivid `#rrggbb` colour.
pub fn random_color() -> String {
    color_from_seed(Uuid::new_v4().as_u128())
}

/// Stable colour for a seed: the hue comes from the seed, saturation and
/// lightness are fixed so every colour is readable as a highlight.
pub fn color_from_seed(seed: u128) -> String {
    let hue = ((seed % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Label colour for text drawn on `background`: black on light colours,
/// white on dark ones and on anything unparsable.
pub fn font_color_for_background(background: &str) -> &'static str {
    let hex = background.trim_start_matches('#');
    match u32::from_str_radix(hex, 16) {
        Ok(value) if value > 0xff_ffff / 2 => "#000",
        _ => "#fff",
    }
}

const ADJECTIVES: &[&str] = &[
    "Amber", "Brave", "Calm", "Daring", "Eager", "Fuzzy", "Gentle", "Happy", "Jolly", "Lucky",
    "Mellow", "Nimble", "Quiet", "Rapid", "Sunny", "Witty",
];

const ANIMALS: &[&str] = &[
    "Badger", "Falcon", "Gecko", "Heron", "Ibex", "Koala", "Lynx", "Marmot", "Narwhal", "Otter",
    "Panda", "Quokka", "Raven", "Tapir", "Walrus", "Yak",
];

/// A random two-word display name such as "Nimble Otter".
pub fn random_name() -> String {
    let seed = Uuid::new_v4().as_u128();
    let adjective = ADJECTIVES[(seed % ADJECTIVES.len() as u128) as usize];
    let animal = ANIMALS[((seed >> 64) % ANIMALS.len() as u128) as usize];
    format!("{adjective} {animal}")
}

/// Style rules giving one client's highlights its colour.
pub fn style_rules_for(client_id: ClientId, color: &str) -> Vec<StyleRule> {
    vec![
        StyleRule {
            selector: format!(".yRemoteSelection-{client_id}"),
            declarations: format!("background-color: {color}70;"),
        },
        StyleRule {
            selector: format!(".yRemoteSelectionHead-{client_id}"),
            declarations: format!(
                "position: absolute; border-left: {color} solid 2px; \
                 border-top: {color} solid 2px; border-bottom: {color} solid 2px; \
                 height: 100%; box-sizing: border-box;"
            ),
        },
    ]
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

struct PresenceInner {
    room: Rc<dyn Room>,
    text: ReplicatedText,
    model: Rc<dyn TextModel>,
    editors: Vec<Rc<dyn EditorView>>,
    roster: RefCell<Roster>,
    decorations: RefCell<HashMap<EditorId, Vec<DecorationId>>>,
    widgets: RefCell<HashMap<EditorId, Vec<String>>>,
    installed_styles: RefCell<BTreeSet<ClientId>>,
    roster_listeners: Listeners<Roster>,
    room_listener: Cell<Option<ListenerId>>,
}

/// Renders remote selections into editors and keeps the roster.
/// Clones share state.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Rc<PresenceInner>,
}

impl PresenceTracker {
    pub fn attach(
        room: Rc<dyn Room>,
        text: ReplicatedText,
        model: Rc<dyn TextModel>,
        editors: Vec<Rc<dyn EditorView>>,
    ) -> Self {
        let inner = Rc::new(PresenceInner {
            room,
            text,
            model,
            editors,
            roster: RefCell::new(Roster::default()),
            decorations: RefCell::new(HashMap::new()),
            widgets: RefCell::new(HashMap::new()),
            installed_styles: RefCell::new(BTreeSet::new()),
            roster_listeners: Listeners::new(),
            room_listener: Cell::new(None),
        });
        let weak = Rc::downgrade(&inner);
        let id = inner.room.on_change(Box::new(move |change| {
            if let Some(inner) = weak.upgrade() {
                PresenceTracker { inner }.on_room_change(change);
            }
        }));
        inner.room_listener.set(Some(id));

        let tracker = Self { inner };
        tracker.sync_roster();
        tracker.install_styles();
        tracker
    }

    pub fn roster(&self) -> Roster {
        self.inner.roster.borrow().clone()
    }

    pub fn viewer(&self) -> Option<Collaborator> {
        self.inner.roster.borrow().viewer.clone()
    }

    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.inner.roster.borrow().collaborators.clone()
    }

    pub fn on_roster_change(&self, callback: impl Fn(&Roster) + 'static) -> ListenerId {
        self.inner.roster_listeners.subscribe(callback)
    }

    pub fn remove_roster_listener(&self, id: ListenerId) -> bool {
        self.inner.roster_listeners.unsubscribe(id)
    }

    /// Rename the local participant. Blank names are refused.
    pub fn change_name(&self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        update_local_state(self.inner.room.as_ref(), |state| state.name = name.to_string())
    }

    /// Remote selections resolved against the current document.
    pub fn highlights(&self) -> Vec<RemoteHighlight> {
        self.inner
            .text
            .with_read(|txn| self.highlights_in(txn))
            .unwrap_or_default()
    }

    pub fn highlights_in<T: ReadTxn>(&self, txn: &T) -> Vec<RemoteHighlight> {
        let inner = &self.inner;
        let local = inner.room.client_id();
        let len = inner.model.len();
        inner
            .room
            .states()
            .into_iter()
            .filter(|(id, state)| *id != local && state.is_well_formed())
            .filter_map(|(id, state)| {
                let selection = state.selection.as_ref()?;
                let anchor = RelativePosition::from_bytes(&selection.anchor).ok()?;
                let head = RelativePosition::from_bytes(&selection.head).ok()?;
                let (Some(anchor), Some(head)) = (
                    inner.text.resolve(txn, &anchor),
                    inner.text.resolve(txn, &head),
                ) else {
                    log::trace!("selection of client {id} does not resolve");
                    return None;
                };
                let (anchor, head) = ((anchor as usize).min(len), (head as usize).min(len));
                let (start, end, head_at_start) = if anchor < head {
                    (anchor, head, false)
                } else {
                    (head, anchor, true)
                };
                Some(RemoteHighlight {
                    client_id: id,
                    name: state.name,
                    color: state.color,
                    start,
                    end,
                    head_at_start,
                })
            })
            .collect()
    }

    /// Redraw with a fresh read transaction. Skipped while a write
    /// transaction is open; the binding renders at its end instead.
    pub fn render(&self) {
        self.inner.text.with_read(|txn| self.render_in(txn));
    }

    pub fn render_in<T: ReadTxn>(&self, txn: &T) {
        let inner = &self.inner;
        let highlights = self.highlights_in(txn);
        for editor in &inner.editors {
            let editor_id = editor.id();
            let stale_widgets = inner.widgets.borrow_mut().remove(&editor_id).unwrap_or_default();
            for widget_id in stale_widgets {
                editor.remove_content_widget(&widget_id);
            }
            let old = inner
                .decorations
                .borrow_mut()
                .remove(&editor_id)
                .unwrap_or_default();

            if editor.model_id() != Some(inner.model.id()) {
                editor.delta_decorations(&old, Vec::new());
                continue;
            }

            let line_height = editor.line_height();
            let mut decorations = Vec::with_capacity(highlights.len());
            let mut widget_ids = Vec::with_capacity(highlights.len());
            for h in &highlights {
                let start = inner.model.position_at(h.start);
                let end = inner.model.position_at(h.end);
                let head_class = format!("yRemoteSelectionHead yRemoteSelectionHead-{}", h.client_id);
                decorations.push(Decoration {
                    start,
                    end,
                    class_name: format!("yRemoteSelection yRemoteSelection-{}", h.client_id),
                    before_content_class: h.head_at_start.then(|| head_class.clone()),
                    after_content_class: (!h.head_at_start).then_some(head_class),
                });
                let widget = ContentWidget {
                    id: h.client_id.to_string(),
                    label: h.name.clone(),
                    background: h.color.clone(),
                    foreground: font_color_for_background(&h.color).to_string(),
                    height: line_height,
                    start,
                    end,
                    placement: WidgetPlacement::Above,
                };
                widget_ids.push(widget.id.clone());
                editor.add_content_widget(widget);
            }
            let ids = editor.delta_decorations(&old, decorations);
            inner.decorations.borrow_mut().insert(editor_id, ids);
            inner.widgets.borrow_mut().insert(editor_id, widget_ids);
        }
    }

    /// Stop listening to the room and clear everything drawn.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if let Some(id) = inner.room_listener.take() {
            inner.room.remove_listener(id);
        }
        for editor in &inner.editors {
            let old = inner
                .decorations
                .borrow_mut()
                .remove(&editor.id())
                .unwrap_or_default();
            editor.delta_decorations(&old, Vec::new());
            let widgets = inner.widgets.borrow_mut().remove(&editor.id()).unwrap_or_default();
            for widget_id in widgets {
                editor.remove_content_widget(&widget_id);
            }
        }
        inner.roster_listeners.clear();
    }

    fn on_room_change(&self, change: &AwarenessChange) {
        log::trace!("presence change: {change:?}");
        self.sync_roster();
        self.install_styles();
        self.render();
    }

    fn sync_roster(&self) {
        let inner = &self.inner;
        let local = inner.room.client_id();
        let mut roster = Roster::default();
        for (id, state) in inner.room.states() {
            if !state.is_well_formed() {
                log::debug!("ignoring malformed presence state of client {id}");
                continue;
            }
            let PeerState { name, color, .. } = state;
            let collaborator = Collaborator { id, name, color };
            if id == local {
                roster.viewer = Some(collaborator);
            } else {
                roster.collaborators.push(collaborator);
            }
        }
        let changed = *inner.roster.borrow() != roster;
        if changed {
            *inner.roster.borrow_mut() = roster.clone();
            inner.roster_listeners.emit(&roster);
        }
    }

    fn install_styles(&self) {
        let inner = &self.inner;
        let rules: Vec<StyleRule> = {
            let mut installed = inner.installed_styles.borrow_mut();
            inner
                .roster
                .borrow()
                .collaborators
                .iter()
                .filter(|c| installed.insert(c.id))
                .flat_map(|c| style_rules_for(c.id, &c.color))
                .collect()
        };
        if rules.is_empty() {
            return;
        }
        for editor in &inner.editors {
            editor.install_style_rules(&rules);
        }
    }
}

use serde::{Deserialize, Serialize};

// TRIGGER TYPE ----------------------------------------------------------------

/// How a trigger condition fires.
///
/// `Ttl` fires on every pulse of its TTL line. `Message` fires as soon as a
/// broadcast message matches the condition name. `TtlAndMessage` is a
/// one-shot: a matching message arms the condition, and the next TTL pulse
/// fires it and disarms it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Ttl,
    Message,
    TtlAndMessage,
}

impl TriggerType {
    /// Armed state of a freshly created or re-typed condition.
    pub fn initially_armed(self) -> bool {
        matches!(self, TriggerType::Ttl)
    }

    /// Numeric index used by remote configuration messages (1-3).
    pub fn from_index(index: u8) -> Option<TriggerType> {
        match index {
            1 => Some(TriggerType::Ttl),
            2 => Some(TriggerType::Message),
            3 => Some(TriggerType::TtlAndMessage),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            TriggerType::Ttl => 1,
            TriggerType::Message => 2,
            TriggerType::TtlAndMessage => 3,
        }
    }
}

/// Outcome of presenting a matching broadcast message to a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The condition fires immediately.
    Fire,
    /// The condition is now armed for the next TTL pulse.
    Armed,
    /// Messages do not affect this condition.
    Ignored,
}

// COLOUR ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Colour {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Colour {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn hex_string(&self) -> String {
        format!("{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Condition colours, assigned by registration order modulo 8.
pub const CONDITION_PALETTE: [Colour; 8] = [
    Colour::new(255, 224, 93),
    Colour::new(255, 178, 99),
    Colour::new(255, 109, 161),
    Colour::new(246, 102, 255),
    Colour::new(175, 98, 255),
    Colour::new(90, 241, 233),
    Colour::new(109, 175, 136),
    Colour::new(160, 237, 181),
];

// TRIGGER SOURCE --------------------------------------------------------------

/// Stable handle to a trigger source; never reused after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub u32);

/// A named trigger condition defining trial onsets.
#[derive(Debug, Clone)]
pub struct TriggerSource {
    pub id: SourceId,
    pub name: String,
    /// TTL line index, or -1 for none.
    pub line: i32,
    pub trigger_type: TriggerType,
    pub colour: Colour,
    pub can_trigger: bool,
}

impl TriggerSource {
    /// Transition for a broadcast message whose text matches this condition.
    fn on_matching_message(&mut self) -> MessageOutcome {
        match self.trigger_type {
            TriggerType::Ttl => MessageOutcome::Ignored,
            TriggerType::Message => MessageOutcome::Fire,
            TriggerType::TtlAndMessage => {
                self.can_trigger = true;
                MessageOutcome::Armed
            }
        }
    }

    /// Transition for a TTL pulse on this condition's line. Returns true if
    /// the condition fires.
    fn on_ttl_pulse(&mut self) -> bool {
        match self.trigger_type {
            TriggerType::Ttl => true,
            TriggerType::Message => false,
            TriggerType::TtlAndMessage => {
                if self.can_trigger {
                    self.can_trigger = false;
                    true
                } else {
                    false
                }
            }
        }
    }
}

// REGISTRY --------------------------------------------------------------------

/// Owns every trigger source. Other components refer to sources through
/// [`SourceId`] handles only.
pub struct TriggerSourceRegistry {
    sources: Vec<TriggerSource>,
    // Counts every registration ever made; drives default names, colours,
    // and ids, and is never decremented.
    registration_count: u32,
}

impl TriggerSourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            registration_count: 0,
        }
    }

    /// Adds a condition with an auto-generated name ("Condition N") and a
    /// palette colour. N is monotonic and never reused after deletions.
    pub fn add_trigger_source(&mut self, line: i32, trigger_type: TriggerType) -> SourceId {
        let n = self.registration_count;
        let id = SourceId(n);
        let name = self.ensure_unique_name(&format!("Condition {}", n + 1), None);

        self.sources.push(TriggerSource {
            id,
            name,
            line,
            trigger_type,
            colour: CONDITION_PALETTE[n as usize % CONDITION_PALETTE.len()],
            can_trigger: trigger_type.initially_armed(),
        });

        self.registration_count += 1;
        id
    }

    pub fn remove_trigger_sources(&mut self, ids: &[SourceId]) {
        self.sources.retain(|s| !ids.contains(&s.id));
    }

    pub fn sources(&self) -> &[TriggerSource] {
        &self.sources
    }

    pub fn get(&self, id: SourceId) -> Option<&TriggerSource> {
        self.sources.iter().find(|s| s.id == id)
    }

    fn get_mut(&mut self, id: SourceId) -> Result<&mut TriggerSource, String> {
        self.sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| format!("unknown trigger source id {}", id.0))
    }

    /// Resolves a candidate name against the registry, case-insensitively.
    /// On collision the smallest " (n)" suffix with n >= 1 is appended.
    /// `exclude` skips the source being renamed.
    pub fn ensure_unique_name(&self, candidate: &str, exclude: Option<SourceId>) -> String {
        let taken = |name: &str| {
            self.sources
                .iter()
                .filter(|s| Some(s.id) != exclude)
                .any(|s| s.name.eq_ignore_ascii_case(name))
        };

        if !taken(candidate) {
            return candidate.to_string();
        }

        let mut n = 1;
        loop {
            let alternate = format!("{} ({})", candidate, n);
            if !taken(&alternate) {
                return alternate;
            }
            n += 1;
        }
    }

    /// Sets the name as given. Uniqueness is resolved by the caller via
    /// [`ensure_unique_name`](Self::ensure_unique_name).
    pub fn set_name(&mut self, id: SourceId, name: &str) -> Result<(), String> {
        self.get_mut(id)?.name = name.to_string();
        Ok(())
    }

    pub fn set_line(&mut self, id: SourceId, line: i32) -> Result<(), String> {
        self.get_mut(id)?.line = line;
        Ok(())
    }

    /// Changes the trigger type and re-derives the armed state, so a
    /// `TtlAndMessage` condition always starts disarmed.
    pub fn set_type(&mut self, id: SourceId, trigger_type: TriggerType) -> Result<(), String> {
        let source = self.get_mut(id)?;
        source.trigger_type = trigger_type;
        source.can_trigger = trigger_type.initially_armed();
        Ok(())
    }

    pub fn set_colour(&mut self, id: SourceId, colour: Colour) -> Result<(), String> {
        self.get_mut(id)?.colour = colour;
        Ok(())
    }

    /// Applies a TTL pulse on the given line and returns the conditions that
    /// fire on it.
    pub fn handle_ttl_pulse(&mut self, line: i32) -> Vec<SourceId> {
        self.sources
            .iter_mut()
            .filter(|s| s.line >= 0 && s.line == line)
            .filter_map(|s| if s.on_ttl_pulse() { Some(s.id) } else { None })
            .collect()
    }

    /// Matches a broadcast message against condition names
    /// (case-insensitively) and returns the conditions that fire
    /// immediately. Matching `TtlAndMessage` conditions are armed instead.
    pub fn handle_broadcast_message(&mut self, message: &str) -> Vec<SourceId> {
        let text = message.trim();

        self.sources
            .iter_mut()
            .filter(|s| s.name.eq_ignore_ascii_case(text))
            .filter_map(|s| match s.on_matching_message() {
                MessageOutcome::Fire => Some(s.id),
                MessageOutcome::Armed | MessageOutcome::Ignored => None,
            })
            .collect()
    }
}

impl Default for TriggerSourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

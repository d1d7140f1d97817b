//! Refinement prompt: system rules plus the owner's memory ledger.

use memforge_state::{Memory, OwnerSettings};

/// Style used when an owner has none (or a blank one).
pub const DEFAULT_STYLE_PROMPT: &str = "Write memories as short, factual, third-person statements. \
Keep names, dates and preferences exact. Prefer one idea per memory.";

/// Budget figures shown to the model.
#[derive(Debug, Clone, Copy)]
pub struct LedgerStats {
    pub core_mass: u64,
    pub mass_budget: u64,
    pub retention_threshold: f64,
    pub max_mutations: u32,
}

impl LedgerStats {
    /// Lowest core mass the session may end at.
    pub fn retention_floor(&self) -> u64 {
        (self.core_mass as f64 * self.retention_threshold).ceil() as u64
    }
}

pub fn style_for(settings: Option<&OwnerSettings>) -> &str {
    settings
        .and_then(OwnerSettings::effective_style)
        .unwrap_or(DEFAULT_STYLE_PROMPT)
}

pub fn system_prompt(stats: &LedgerStats, style: &str) -> String {
    format!(
        "You maintain a person's long-term memory. Refine it so it stays accurate, compact and \
useful. Work only through the `memory` tool.\n\
\n\
Hard rules:\n\
1. At most {max} mutating calls (consolidate, update, delete) this session. A batch delete counts once. \
search, protect and complete are always allowed.\n\
2. Protected memories can never be updated, consolidated or deleted.\n\
3. Core memory mass must stay at or above {floor} ({pct:.0}% of the current {mass}). \
If a change drops it below that, the whole session is reverted.\n\
4. Never invent facts. Consolidated or updated text may only restate what the originals say.\n\
5. Protect memories that are identity-defining or safety-relevant.\n\
6. Call `complete` with a one-paragraph summary when you are done.\n\
\n\
Style: {style}",
        max = stats.max_mutations,
        floor = stats.retention_floor(),
        pct = stats.retention_threshold * 100.0,
        mass = stats.core_mass,
        style = style,
    )
}

/// Core memories oldest first, one per line.
pub fn ledger(owner_id: &str, memories: &[Memory], stats: &LedgerStats) -> String {
    let core: Vec<&Memory> = memories.iter().filter(|m| m.is_core()).collect();
    let mut out = format!(
        "Owner: {owner_id}\nCore mass: {} (budget {})\nMemories ({}), oldest first:\n",
        stats.core_mass,
        stats.mass_budget,
        core.len()
    );
    for m in &core {
        let flag = if m.protected { " [protected]" } else { "" };
        out.push_str(&format!(
            "- id={} mass={} created={}{}: {}\n",
            m.id,
            m.mass,
            m.created_at.format("%Y-%m-%d"),
            flag,
            m.content.replace('\n', " ")
        ));
    }
    if core.is_empty() {
        out.push_str("(none)\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> LedgerStats {
        LedgerStats {
            core_mass: 200,
            mass_budget: 150,
            retention_threshold: 0.7,
            max_mutations: 10,
        }
    }

    #[test]
    fn test_blank_style_falls_back_to_default() {
        assert_eq!(style_for(None), DEFAULT_STYLE_PROMPT);
        let blank = OwnerSettings::new("o").with_style_prompt("  ");
        assert_eq!(style_for(Some(&blank)), DEFAULT_STYLE_PROMPT);
        let custom = OwnerSettings::new("o").with_style_prompt("bullet points");
        assert_eq!(style_for(Some(&custom)), "bullet points");
    }

    #[test]
    fn test_system_prompt_states_limits() {
        let prompt = system_prompt(&stats(), "terse");
        assert!(prompt.contains("At most 10 mutating calls"));
        assert!(prompt.contains("at or above 140"));
        assert!(prompt.ends_with("Style: terse"));
    }

    #[test]
    fn test_ledger_lists_memories_in_given_order() {
        let memories = vec![
            Memory::core("o", "first").with_id("a"),
            Memory::core("o", "second").with_id("b").with_protected(true),
        ];
        let ledger = ledger("o", &memories, &stats());
        let a = ledger.find("id=a").unwrap();
        let b = ledger.find("id=b").unwrap();
        assert!(a < b);
        assert!(ledger.contains("[protected]: second"));
    }

    #[test]
    fn test_ledger_counts_only_core_memories() {
        let memories = vec![
            Memory::core("o", "keeps tea").with_id("c1"),
            Memory::journal("o", "session notes").with_id("j1"),
        ];
        let text = ledger("o", &memories, &stats());
        assert!(text.contains("Memories (1), oldest first:"));
        assert!(text.contains("id=c1"));
        assert!(!text.contains("j1"));

        let journal_only = vec![Memory::journal("o", "session notes")];
        let text = ledger("o", &journal_only, &stats());
        assert!(text.contains("Memories (0)"));
        assert!(text.ends_with("(none)\n"));
    }
}

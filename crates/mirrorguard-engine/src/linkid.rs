/*
[INPUT]:  Symbol, tranche/SL markers, mirror flag, optional disambiguator
[OUTPUT]: Exchange order link ids and their parsed semantic roles
[POS]:    Identity layer - client order-id grammar shared by all components
[UPDATE]: When the link-id grammar or length cap changes
*/

use serde::{Deserialize, Serialize};

/// Strategy tag prefixing every link id this system produces.
pub const STRATEGY_TAG: &str = "MG";

/// Suffix marking a mirrored order. Appended exactly once.
pub const MIRROR_SUFFIX: &str = "_MIRROR";

/// Marker for the stop-loss order.
pub const SL_MARKER: &str = "SL";

/// Exchange-imposed cap on client order id length.
pub const LINK_ID_MAX_LEN: usize = 45;

/// Semantic role recovered from a link id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkRole {
    /// Take-profit tranche, zero-based index.
    TakeProfit(usize),
    StopLoss,
}

/// A parsed link id produced by this system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLinkId {
    pub role: LinkRole,
    pub mirror: bool,
}

fn marker_for(role: LinkRole) -> String {
    match role {
        // Markers are one-based: TP1 is the first tranche.
        LinkRole::TakeProfit(index) => format!("TP{}", index + 1),
        LinkRole::StopLoss => SL_MARKER.to_string(),
    }
}

/// Build a link id: `<tag>_<symbol>_<marker>[_MIRROR][_<disambiguator>]`.
///
/// Ids longer than the exchange cap are shortened by trimming the symbol
/// segment so the markers at the tail stay recognizable.
pub fn build_link_id(
    symbol: &str,
    role: LinkRole,
    mirror: bool,
    disambiguator: Option<&str>,
) -> String {
    let marker = marker_for(role);
    let mut tail = marker;
    if mirror {
        tail.push_str(MIRROR_SUFFIX);
    }
    if let Some(extra) = disambiguator {
        tail.push('_');
        tail.push_str(extra);
    }

    // tag + '_' + symbol + '_' + tail
    let fixed_len = STRATEGY_TAG.len() + 2 + tail.len();
    let budget = LINK_ID_MAX_LEN.saturating_sub(fixed_len);
    let symbol_part: String = symbol.chars().take(budget).collect();

    format!("{STRATEGY_TAG}_{symbol_part}_{tail}")
}

/// Append the mirror suffix to a primary link id, idempotently. The
/// disambiguator segment (if any) stays at the tail.
pub fn to_mirror_link_id(link_id: &str) -> String {
    if link_id.contains(MIRROR_SUFFIX) {
        return link_id.to_string();
    }

    let mirrored = format!("{link_id}{MIRROR_SUFFIX}");
    if mirrored.len() <= LINK_ID_MAX_LEN {
        return mirrored;
    }

    // Drop symbol characters to make room for the suffix.
    let overflow = mirrored.len() - LINK_ID_MAX_LEN;
    let parts: Vec<&str> = link_id.splitn(3, '_').collect();
    if parts.len() == 3 && parts[1].len() > overflow {
        let kept = &parts[1][..parts[1].len() - overflow];
        return format!("{}_{kept}_{}{MIRROR_SUFFIX}", parts[0], parts[2]);
    }

    mirrored.chars().take(LINK_ID_MAX_LEN).collect()
}

/// Parse a link id produced by this system. Returns None for foreign ids.
pub fn parse_link_id(link_id: &str) -> Option<ParsedLinkId> {
    if !link_id.starts_with(STRATEGY_TAG) {
        return None;
    }

    let mirror = link_id.contains(MIRROR_SUFFIX);

    for segment in link_id.split('_') {
        if segment == SL_MARKER {
            return Some(ParsedLinkId {
                role: LinkRole::StopLoss,
                mirror,
            });
        }
        if let Some(raw_index) = segment.strip_prefix("TP") {
            if let Ok(number) = raw_index.parse::<usize>() {
                if number >= 1 {
                    return Some(ParsedLinkId {
                        role: LinkRole::TakeProfit(number - 1),
                        mirror,
                    });
                }
            }
        }
    }

    None
}

/// Whether a link id was produced by this system at all.
pub fn is_owned_link_id(link_id: &str) -> bool {
    link_id.starts_with(STRATEGY_TAG) && parse_link_id(link_id).is_some()
}

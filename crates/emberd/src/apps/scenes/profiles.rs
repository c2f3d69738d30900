//! Per-device scene binding tables.
//!
//! Each profile is the explicit label-to-action mapping for one physical
//! switch. Labels left out of a table are decoded and logged but do
//! nothing, and several labels may share one action.

use super::Direction;
use super::SceneAction;
use super::SceneBindings;
use super::SceneLabel;
use super::ScenePress;
use crate::config::SceneConfig;
use crate::config::SceneProfile;

const DEFAULT_COVER: &str = "cover.desk";
const DEFAULT_GROUPS: [&str; 2] = ["group.master_bathroom_lights", "group.master_bedroom_lights"];
const DEFAULT_ALL_GROUP: &str = "group.all_lights";

/// Delay before the entry switch turns everything off
const ENTRY_OFF_DELAY_SECS: u64 = 30;

/// Build the binding table for an instance, plus whether its LED feedback
/// hooks are enabled.
pub fn bindings(config: &SceneConfig) -> (SceneBindings, bool) {
    match config.profile {
        SceneProfile::Office => (office(config), true),
        SceneProfile::MasterBedroom => (master_bedroom(config), false),
        SceneProfile::Entry => (entry(config), true),
    }
}

fn label(direction: Direction, press: ScenePress) -> SceneLabel {
    SceneLabel::new(direction, press)
}

/// Double-tap drives the desk: up raises it, down brings it to sitting
/// height.
fn office(config: &SceneConfig) -> SceneBindings {
    let cover = config
        .cover
        .clone()
        .unwrap_or_else(|| DEFAULT_COVER.to_string());

    let mut bindings = SceneBindings::new();
    bindings.insert(
        label(Direction::Up, ScenePress::Press(2)),
        SceneAction::CoverPosition {
            cover: cover.clone(),
            position: 100,
        },
    );
    bindings.insert(
        label(Direction::Down, ScenePress::Press(2)),
        SceneAction::CoverPosition {
            cover,
            position: 26,
        },
    );
    bindings
}

/// Double, triple, and quadruple taps all toggle the bedroom and bathroom
/// groups; this switch keeps its LEDs quiet.
fn master_bedroom(config: &SceneConfig) -> SceneBindings {
    let groups = config.groups.clone().unwrap_or_else(|| {
        DEFAULT_GROUPS.iter().map(|g| g.to_string()).collect()
    });
    let on = SceneAction::GroupsOn {
        groups: groups.clone(),
    };
    let off = SceneAction::GroupsOff { groups };

    let mut bindings = SceneBindings::new();
    for count in 2..=4 {
        bindings.insert(label(Direction::Up, ScenePress::Press(count)), on.clone());
        bindings.insert(label(Direction::Down, ScenePress::Press(count)), off.clone());
    }
    bindings
}

/// Hold or multi-tap down on the way out: everything off after a grace
/// period.
fn entry(config: &SceneConfig) -> SceneBindings {
    let group = config
        .group
        .clone()
        .unwrap_or_else(|| DEFAULT_ALL_GROUP.to_string());
    let off = SceneAction::DeferredOff {
        group,
        delay_secs: ENTRY_OFF_DELAY_SECS,
    };

    let mut bindings = SceneBindings::new();
    bindings.insert(label(Direction::Down, ScenePress::Held), off.clone());
    for count in 2..=4 {
        bindings.insert(label(Direction::Down, ScenePress::Press(count)), off.clone());
    }
    bindings
}

use crate::command::GuestAction;
use crate::guest::{GuestId, PowerState};
use serde::{Deserialize, Serialize};

/// One entry of the indicator menu, already projected for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: GuestId,
    pub display_name: String,
    pub state: PowerState,
    pub available_actions: Vec<GuestAction>,
}

impl MenuItem {
    /// Actions offered for a displayed state. Transitioning and unknown
    /// guests get none until a poll settles their state.
    pub fn actions_for(state: PowerState) -> Vec<GuestAction> {
        match state {
            PowerState::Running => vec![GuestAction::Stop],
            PowerState::Stopped => vec![GuestAction::Start],
            PowerState::Transitioning | PowerState::Unknown => Vec::new(),
        }
    }
}

/// Instructions consumed by the presentation adapter. The engine emits these;
/// it never touches rendering primitives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderInstruction {
    SetIndicator {
        has_running_guest: bool,
        stale: bool,
    },
    SetMenu {
        items: Vec<MenuItem>,
    },
    ShowError {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_follow_displayed_state() {
        assert_eq!(
            MenuItem::actions_for(PowerState::Running),
            vec![GuestAction::Stop]
        );
        assert_eq!(
            MenuItem::actions_for(PowerState::Stopped),
            vec![GuestAction::Start]
        );
        assert!(MenuItem::actions_for(PowerState::Transitioning).is_empty());
        assert!(MenuItem::actions_for(PowerState::Unknown).is_empty());
    }

    #[test]
    fn instructions_serialize_with_type_tags() {
        let instruction = RenderInstruction::SetIndicator {
            has_running_guest: true,
            stale: false,
        };
        let json = serde_json::to_string(&instruction).expect("serialize");
        assert!(json.contains("\"type\":\"set_indicator\""));

        let menu = RenderInstruction::SetMenu {
            items: vec![MenuItem {
                id: GuestId::from("vm-a"),
                display_name: "alpha".to_string(),
                state: PowerState::Running,
                available_actions: MenuItem::actions_for(PowerState::Running),
            }],
        };
        let json = serde_json::to_string(&menu).expect("serialize");
        assert!(json.contains("\"state\":\"running\""));
        assert!(json.contains("\"available_actions\":[\"stop\"]"));
    }
}

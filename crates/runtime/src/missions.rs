//! Learn-mode missions: guided multi-step exercises tracked in memory.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionStep {
    pub prompt: String,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_answer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: Uuid,
    pub topic: String,
    pub steps: Vec<MissionStep>,
}

impl Mission {
    pub fn new(topic: &str) -> Self {
        let steps = [
            format!("Describe what '{topic}' is and where it appears in practice."),
            format!("Walk through how an attacker uses {topic} against a real target."),
            format!("List the defensive controls that blunt {topic}, most effective first."),
            format!("Run (or simulate) one tool that demonstrates {topic} and interpret its output."),
        ]
        .into_iter()
        .map(|prompt| MissionStep {
            prompt,
            completed: false,
            submitted_answer: None,
        })
        .collect();

        Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            steps,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.completed)
    }
}

/// In-memory mission tracker.  Missions are session-scoped training state,
/// not persistent knowledge, so they live and die with the process.
#[derive(Default)]
pub struct MissionBoard {
    missions: Mutex<HashMap<Uuid, Mission>>,
}

impl MissionBoard {
    pub async fn start(&self, topic: &str) -> Mission {
        let mission = Mission::new(topic);
        self.missions
            .lock()
            .await
            .insert(mission.id, mission.clone());
        mission
    }

    pub async fn get(&self, id: Uuid) -> Option<Mission> {
        self.missions.lock().await.get(&id).cloned()
    }

    /// Mark a step submitted.  Returns the updated mission, or `None` when
    /// the mission or step index does not exist.
    pub async fn submit(&self, id: Uuid, step_index: usize, answer: &str) -> Option<Mission> {
        let mut missions = self.missions.lock().await;
        let mission = missions.get_mut(&id)?;
        let step = mission.steps.get_mut(step_index)?;
        step.completed = true;
        step.submitted_answer = Some(answer.to_string());
        Some(mission.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mission_lifecycle() {
        let board = MissionBoard::default();
        let mission = board.start("sql injection").await;
        assert_eq!(mission.steps.len(), 4);
        assert!(!mission.is_complete());

        for i in 0..4 {
            board.submit(mission.id, i, "my answer").await.unwrap();
        }
        let done = board.get(mission.id).await.unwrap();
        assert!(done.is_complete());
        assert_eq!(done.steps[0].submitted_answer.as_deref(), Some("my answer"));
    }

    #[tokio::test]
    async fn bad_indices_are_none() {
        let board = MissionBoard::default();
        let mission = board.start("xss").await;
        assert!(board.submit(mission.id, 99, "x").await.is_none());
        assert!(board.submit(Uuid::new_v4(), 0, "x").await.is_none());
    }
}

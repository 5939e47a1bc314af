//! Jupyter notebook rendering of a finished trajectory.

use serde_json::{Value, json};

use crate::action::{Action, MouseButton, ScrollDirection};
use crate::trajectory::{SessionMetadata, TrajectoryLine};

/// Builds an nbformat 4.5 notebook of markdown cells: task metadata, the
/// instruction, then a user / assistant / tool-call triple per step.
pub fn build(meta: &SessionMetadata, lines: &[TrajectoryLine]) -> Value {
    let domain = meta.task_id.split('/').next().unwrap_or("unknown");
    let header = json!({
        "task_id": meta.task_id,
        "domain": domain,
        "instruction": meta.instruction,
        "total_steps": meta.total_steps,
        "complete": meta.complete,
        "timestamp": meta.finished_at.to_rfc3339(),
    });
    let header = serde_json::to_string_pretty(&header).unwrap_or_default();

    let mut cells = vec![
        markdown(format!("## Task Metadata\n\n```json\n{header}\n```")),
        markdown(format!("## Task Instruction\n\n{}", meta.instruction)),
    ];

    for line in lines {
        let screenshot = line.screenshot_before.as_deref().unwrap_or("N/A");
        cells.push(markdown(format!("**[user]**\n\nScreenshot: `{screenshot}`")));
        cells.push(markdown(format!("**[assistant]**\n\n{}", reasoning(&line.action))));
        cells.push(markdown(format!(
            "**[tool_call]**\n\n```python\n{}\n```",
            line.command
        )));
    }

    for (i, cell) in cells.iter_mut().enumerate() {
        cell["id"] = Value::String(format!("cell-{i}"));
    }

    json!({
        "nbformat": 4,
        "nbformat_minor": 5,
        "metadata": {
            "kernelspec": {
                "display_name": "Python 3",
                "language": "python",
                "name": "python3"
            },
            "language_info": { "name": "python" }
        },
        "cells": cells,
    })
}

/// Short first-person explanation of an action, per action kind.
pub fn reasoning(action: &Action) -> String {
    match action {
        Action::Click { x, y, button: MouseButton::Left } => {
            format!("I'll click at position ({x}, {y}) to interact with the element at that location.")
        }
        Action::Click { x, y, button: MouseButton::Right } => {
            format!("I'll right-click at position ({x}, {y}) to open the context menu.")
        }
        Action::Click { x, y, button: MouseButton::Middle } => {
            format!("I'll middle-click at position ({x}, {y}).")
        }
        Action::Type { text } => format!("I'll type '{text}' to enter the required text."),
        Action::Hotkey { keys } => {
            format!("I'll press {} to execute this keyboard shortcut.", keys.join("+"))
        }
        Action::Key { name } => format!("I'll press the {name} key."),
        Action::Scroll { direction, .. } => {
            let dir = match direction {
                ScrollDirection::Up => "up",
                ScrollDirection::Down => "down",
                ScrollDirection::Left => "left",
                ScrollDirection::Right => "right",
            };
            format!("I'll scroll {dir} to navigate the content.")
        }
        Action::Drag { .. } => {
            "I'll drag from the starting position to the ending position.".to_string()
        }
        Action::Wait { seconds } => {
            format!("I'll wait {seconds} seconds for the application to respond.")
        }
        Action::Done => "The task is complete.".to_string(),
    }
}

fn markdown(content: String) -> Value {
    let mut source: Vec<String> = content.split('\n').map(|l| format!("{l}\n")).collect();
    if let Some(last) = source.last_mut() {
        last.pop();
    }
    json!({
        "cell_type": "markdown",
        "metadata": {},
        "source": source,
    })
}

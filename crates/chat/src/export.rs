use crate::thread::{Role, Thread};

const SEPARATOR: &str = "----------------------------------------";

/// Flat text rendering of one thread plus a download-safe file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedThread {
    pub file_name: String,
    pub contents: String,
}

/// Renders the thread as a plain text document: title line, optional system
/// instruction line, a separator, then one block per message with its first
/// text part or an `[Image]` marker.
pub fn render_thread(thread: &Thread) -> ExportedThread {
    let mut contents = format!("Title: {}\n", thread.title);
    if !thread.system_instruction.is_empty() {
        contents.push_str(&format!(
            "System instruction: {}\n",
            thread.system_instruction
        ));
    }
    contents.push_str(SEPARATOR);
    contents.push_str("\n\n");

    for message in &thread.history {
        let author = match message.role {
            Role::User => "User",
            Role::Model => "Model",
        };
        let text = message
            .parts
            .iter()
            .find_map(|part| part.text().filter(|text| !text.is_empty()))
            .unwrap_or("[Image]");
        contents.push_str(&format!("[{author}]:\n{text}\n\n"));
    }

    ExportedThread {
        file_name: export_file_name(&thread.title),
        contents,
    }
}

/// `.txt` file name from the title: spaces become underscores, path-hostile
/// characters are removed, and an empty result degrades to `chat.txt`.
pub fn export_file_name(title: &str) -> String {
    let stem: String = title
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();

    if stem.is_empty() {
        "chat.txt".to_string()
    } else {
        format!("{stem}.txt")
    }
}

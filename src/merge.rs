use crate::message::Message;

/// Combine a server snapshot with the local optimistic copy of the same conversation.
///
/// The server's structure and ids win. When the last messages share a role and the server's
/// text is shorter (the snapshot was taken mid-stream), the local content, reasoning and any
/// longer persona contents are kept on the server's last message.
pub fn merge_messages(server: Vec<Message>, local: &[Message]) -> Vec<Message> {
    let local_last = match local.last() {
        Some(m) => m,
        None => return server,
    };
    if server.is_empty() {
        return local.to_vec();
    }

    let mut merged = server;
    let last = match merged.last_mut() {
        Some(m) => m,
        None => return merged,
    };
    if last.role != local_last.role || last.content.len() >= local_last.content.len() {
        return merged;
    }

    last.content = local_last.content.clone();
    last.reasoning = local_last.reasoning.clone();

    if last.persona_responses.is_empty() {
        last.persona_responses = local_last.persona_responses.clone();
    } else {
        for response in last.persona_responses.iter_mut() {
            if let Some(local_response) = local_last.persona_response(&response.persona_id) {
                if local_response.content.len() > response.content.len() {
                    response.content = local_response.content.clone();
                }
            }
        }
    }
    merged
}

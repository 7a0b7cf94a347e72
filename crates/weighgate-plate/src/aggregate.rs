//! Multi-frame voting.

/// Most frequent reading across frames.
///
/// Ties go to the reading seen first. Returns `None` when no frame produced
/// a reading.
pub fn majority_vote<I, S>(readings: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut tally: Vec<(String, usize)> = Vec::new();
    for reading in readings {
        let reading = reading.as_ref();
        match tally.iter_mut().find(|(text, _)| text == reading) {
            Some((_, count)) => *count += 1,
            None => tally.push((reading.to_string(), 1)),
        }
    }

    let mut winner: Option<(String, usize)> = None;
    for (text, count) in tally {
        if winner.as_ref().map_or(true, |(_, best)| count > *best) {
            winner = Some((text, count));
        }
    }
    winner.map(|(text, _)| text)
}

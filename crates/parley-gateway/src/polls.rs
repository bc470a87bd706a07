use std::collections::HashMap;

use anyhow::Context;
use uuid::Uuid;

use parley_db::models::{PollRecord, PollRow};
use parley_types::frames::ServerFrame;
use parley_types::models::{PollOptionView, PollView};

use crate::error::{GatewayResult, conflict, denied, validation};

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 10;
const MAX_QUESTION_CHARS: usize = 200;
const MAX_OPTION_CHARS: usize = 100;

/// What a vote did to the tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// First vote, or moved from another option.
    Counted,
    /// Same option as before.
    Unchanged,
}

/// A poll with its single-vote-per-user tally. The latest vote wins.
#[derive(Debug, Clone)]
pub struct Poll {
    pub id: Uuid,
    pub room_id: String,
    pub question: String,
    pub options: Vec<String>,
    /// voter -> option index. One entry per voter is the single-vote rule.
    pub votes: HashMap<Uuid, usize>,
    pub created_by: Uuid,
    pub anonymous: bool,
    pub is_closed: bool,
    pub created_at: i64,
}

impl Poll {
    pub fn new(
        room_id: &str,
        question: &str,
        options: &[String],
        created_by: Uuid,
        anonymous: bool,
        now: i64,
    ) -> GatewayResult<Self> {
        let question = question.trim();
        if question.is_empty() || question.chars().count() > MAX_QUESTION_CHARS {
            return Err(validation(format!(
                "poll question must be 1-{} characters",
                MAX_QUESTION_CHARS
            )));
        }
        let options: Vec<String> = options.iter().map(|o| o.trim().to_string()).collect();
        if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&options.len()) {
            return Err(validation(format!(
                "a poll needs {}-{} options",
                MIN_OPTIONS, MAX_OPTIONS
            )));
        }
        if options
            .iter()
            .any(|o| o.is_empty() || o.chars().count() > MAX_OPTION_CHARS)
        {
            return Err(validation(format!(
                "poll options must be 1-{} characters",
                MAX_OPTION_CHARS
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            question: question.to_string(),
            options,
            votes: HashMap::new(),
            created_by,
            anonymous,
            is_closed: false,
            created_at: now,
        })
    }

    pub fn vote(&mut self, user_id: Uuid, option: usize) -> GatewayResult<VoteOutcome> {
        if self.is_closed {
            return Err(conflict("poll is closed"));
        }
        if option >= self.options.len() {
            return Err(validation(format!(
                "option {} does not exist (poll has {})",
                option,
                self.options.len()
            )));
        }
        match self.votes.insert(user_id, option) {
            Some(previous) if previous == option => Ok(VoteOutcome::Unchanged),
            _ => Ok(VoteOutcome::Counted),
        }
    }

    /// Terminal. Only the creator may close.
    pub fn close(&mut self, user_id: Uuid) -> GatewayResult<()> {
        if user_id != self.created_by {
            return Err(denied("only the poll creator can close it"));
        }
        if self.is_closed {
            return Err(conflict("poll is already closed"));
        }
        self.is_closed = true;
        Ok(())
    }

    pub fn tally(&self) -> Vec<PollOptionView> {
        self.options
            .iter()
            .enumerate()
            .map(|(id, text)| {
                let mut voters: Vec<Uuid> = self
                    .votes
                    .iter()
                    .filter(|(_, choice)| **choice == id)
                    .map(|(voter, _)| *voter)
                    .collect();
                voters.sort();
                PollOptionView {
                    id,
                    text: text.clone(),
                    votes: voters.len(),
                    voters: (!self.anonymous).then_some(voters),
                }
            })
            .collect()
    }

    pub fn view(&self) -> PollView {
        PollView {
            id: self.id,
            room_id: self.room_id.clone(),
            question: self.question.clone(),
            options: self.tally(),
            created_by: self.created_by,
            anonymous: self.anonymous,
            is_closed: self.is_closed,
            created_at: self.created_at,
        }
    }

    pub fn results_frame(&self) -> ServerFrame {
        ServerFrame::PollResults {
            poll_id: self.id,
            question: self.question.clone(),
            is_closed: self.is_closed,
            results: self.tally(),
        }
    }

    pub fn to_row(&self) -> PollRow {
        PollRow {
            id: self.id.to_string(),
            room_id: self.room_id.clone(),
            question: self.question.clone(),
            created_by: self.created_by.to_string(),
            anonymous: self.anonymous,
            is_closed: self.is_closed,
            created_at: self.created_at,
        }
    }

    pub fn from_record(record: PollRecord) -> anyhow::Result<Self> {
        let id = record.poll.id.parse().context("malformed poll id")?;
        let created_by = record
            .poll
            .created_by
            .parse()
            .context("malformed poll creator id")?;
        let votes = record
            .votes
            .iter()
            .filter_map(|v| Some((v.user_id.parse().ok()?, usize::try_from(v.option_index).ok()?)))
            .collect();

        Ok(Self {
            id,
            room_id: record.poll.room_id,
            question: record.poll.question,
            options: record.options,
            votes,
            created_by,
            anonymous: record.poll.anonymous,
            is_closed: record.poll.is_closed,
            created_at: record.poll.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll(anonymous: bool) -> (Poll, Uuid) {
        let creator = Uuid::new_v4();
        let options = vec!["Pizza".to_string(), "Sushi".to_string(), "Tacos".to_string()];
        (
            Poll::new("global", "Lunch?", &options, creator, anonymous, 0).unwrap(),
            creator,
        )
    }

    #[test]
    fn revote_moves_the_voter() {
        let (mut poll, _) = poll(false);
        let a = Uuid::new_v4();
        assert_eq!(poll.vote(a, 0).unwrap(), VoteOutcome::Counted);
        assert_eq!(poll.vote(a, 1).unwrap(), VoteOutcome::Counted);
        assert_eq!(poll.vote(a, 1).unwrap(), VoteOutcome::Unchanged);

        let tally = poll.tally();
        assert_eq!(tally.iter().map(|o| o.votes).sum::<usize>(), 1);
        assert_eq!(tally[1].votes, 1);
        assert_eq!(tally[1].voters.as_deref(), Some(&[a][..]));
    }

    #[test]
    fn every_voter_counted_exactly_once() {
        let (mut poll, _) = poll(false);
        let voters: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for (i, v) in voters.iter().enumerate() {
            poll.vote(*v, i % 3).unwrap();
            poll.vote(*v, (i + 1) % 3).unwrap();
        }
        let tally = poll.tally();
        assert_eq!(tally.iter().map(|o| o.votes).sum::<usize>(), voters.len());
    }

    #[test]
    fn close_is_terminal_and_creator_only() {
        let (mut poll, creator) = poll(false);
        assert_eq!(poll.close(Uuid::new_v4()).unwrap_err().code(), "PERMISSION_DENIED");
        poll.close(creator).unwrap();
        assert_eq!(poll.close(creator).unwrap_err().code(), "CONFLICT");
        assert_eq!(poll.vote(Uuid::new_v4(), 0).unwrap_err().code(), "CONFLICT");
    }

    #[test]
    fn anonymous_polls_hide_voters() {
        let (mut poll, _) = poll(true);
        poll.vote(Uuid::new_v4(), 2).unwrap();
        let tally = poll.tally();
        assert_eq!(tally[2].votes, 1);
        assert!(tally.iter().all(|o| o.voters.is_none()));
    }

    #[test]
    fn rejects_bad_shapes() {
        let creator = Uuid::new_v4();
        let one = vec!["only".to_string()];
        assert!(Poll::new("global", "Q", &one, creator, false, 0).is_err());
        let blank = vec!["a".to_string(), "  ".to_string()];
        assert!(Poll::new("global", "Q", &blank, creator, false, 0).is_err());
        let ok = vec!["a".to_string(), "b".to_string()];
        assert!(Poll::new("global", "   ", &ok, creator, false, 0).is_err());

        let (mut poll, _) = poll(false);
        assert_eq!(poll.vote(Uuid::new_v4(), 9).unwrap_err().code(), "VALIDATION_ERROR");
    }
}

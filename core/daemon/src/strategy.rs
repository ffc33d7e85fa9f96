//! Command suggestion strategies.
//!
//! Strategies observe merged records as they are published and keep their
//! own model of the history. The merge store only ever pushes records in
//! and resets them; it never reads their state except through `candidates`.

use histd_protocol::{Record, SuggestionView};
use std::collections::{HashMap, VecDeque};

pub trait Strategy: Send {
    fn title_and_description(&self) -> (String, String);

    /// Suggested command lines, best first.
    fn candidates(&self) -> Vec<String>;

    fn add_history_record(&mut self, record: &Record);

    fn reset_history(&mut self);

    fn view(&self) -> SuggestionView {
        let (title, description) = self.title_and_description();
        SuggestionView {
            title,
            description,
            candidates: self.candidates(),
        }
    }
}

const START_TOKEN: &str = "^";

#[derive(Debug, Clone)]
struct HistoryEntry {
    command: String,
    cmd_line: String,
}

#[derive(Debug, Default)]
struct CommandUse {
    /// Sequence numbers of the live occurrences, oldest first.
    occurrences: VecDeque<u64>,
    lines: HashMap<String, LineUse>,
}

#[derive(Debug)]
struct LineUse {
    count: usize,
    last_seq: u64,
}

/// Order-n Markov chain over the first word of each command line.
///
/// The most probable next command given the last `order` commands is
/// picked, and every distinct command line that started with it is offered,
/// most recent first. Transition counts are kept up to date as records
/// arrive, over a sliding window of the newest `history_limit` records.
#[derive(Debug)]
pub struct MarkovChainCmd {
    order: usize,
    history_limit: usize,
    next_seq: u64,
    history: VecDeque<HistoryEntry>,
    transitions: HashMap<Vec<String>, HashMap<String, usize>>,
    commands: HashMap<String, CommandUse>,
}

impl MarkovChainCmd {
    /// `history_limit` of 0 keeps every record.
    pub fn new(order: usize, history_limit: usize) -> Self {
        let order = order.max(1);
        Self {
            order,
            history_limit: if history_limit == 0 {
                0
            } else {
                history_limit.max(order)
            },
            next_seq: 0,
            history: VecDeque::new(),
            transitions: HashMap::new(),
            commands: HashMap::new(),
        }
    }

    /// The state and next command of the transition ending at `index`, with
    /// the history start-padded by `order` tokens.
    fn transition_at(&self, index: usize) -> (Vec<String>, String) {
        let state = (index..index + self.order)
            .map(|padded| {
                if padded < self.order {
                    START_TOKEN.to_string()
                } else {
                    self.history[padded - self.order].command.clone()
                }
            })
            .collect();
        (state, self.history[index].command.clone())
    }

    fn count_transition(&mut self, index: usize) {
        let (state, next) = self.transition_at(index);
        *self
            .transitions
            .entry(state)
            .or_default()
            .entry(next)
            .or_default() += 1;
    }

    fn uncount_transition(&mut self, index: usize) {
        let (state, next) = self.transition_at(index);
        let Some(counts) = self.transitions.get_mut(&state) else {
            return;
        };
        if let Some(count) = counts.get_mut(&next) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&next);
            }
        }
        if counts.is_empty() {
            self.transitions.remove(&state);
        }
    }

    fn evict_oldest(&mut self) {
        // Dropping the first entry changes the padded state of the next
        // `order` transitions, so those are recounted.
        let affected = self.order.min(self.history.len() - 1);
        for index in 0..=affected {
            self.uncount_transition(index);
        }
        let Some(oldest) = self.history.pop_front() else {
            return;
        };
        for index in 0..self.order.min(self.history.len()) {
            self.count_transition(index);
        }

        let Some(usage) = self.commands.get_mut(&oldest.command) else {
            return;
        };
        usage.occurrences.pop_front();
        if let Some(line) = usage.lines.get_mut(&oldest.cmd_line) {
            line.count -= 1;
            if line.count == 0 {
                usage.lines.remove(&oldest.cmd_line);
            }
        }
        if usage.occurrences.is_empty() {
            self.commands.remove(&oldest.command);
        }
    }

    fn first_seen(&self, command: &str) -> u64 {
        self.commands
            .get(command)
            .and_then(|usage| usage.occurrences.front().copied())
            .unwrap_or(u64::MAX)
    }
}

impl Strategy for MarkovChainCmd {
    fn title_and_description(&self) -> (String, String) {
        (
            format!("command-based markov chain (order {})", self.order),
            "Use command-based markov chain to recommend commands".to_string(),
        )
    }

    fn candidates(&self) -> Vec<String> {
        if self.history.len() < self.order {
            return self
                .history
                .iter()
                .map(|entry| entry.cmd_line.clone())
                .collect();
        }

        let current: Vec<String> = self
            .history
            .range(self.history.len() - self.order..)
            .map(|entry| entry.command.clone())
            .collect();

        // Highest transition count wins; the command seen first breaks ties,
        // and with no known transition the oldest command is offered.
        let best = match self.transitions.get(&current) {
            Some(next) => next
                .iter()
                .max_by(|a, b| {
                    a.1.cmp(b.1)
                        .then_with(|| self.first_seen(b.0).cmp(&self.first_seen(a.0)))
                })
                .map(|(command, _)| command.as_str()),
            None => self
                .commands
                .iter()
                .min_by_key(|(_, usage)| usage.occurrences.front().copied().unwrap_or(u64::MAX))
                .map(|(command, _)| command.as_str()),
        };
        let Some(usage) = best.and_then(|command| self.commands.get(command)) else {
            return Vec::new();
        };

        let mut ranked: Vec<(&String, u64)> = usage
            .lines
            .iter()
            .map(|(cmd_line, line)| (cmd_line, line.last_seq))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
            .into_iter()
            .map(|(cmd_line, _)| cmd_line.clone())
            .collect()
    }

    fn add_history_record(&mut self, record: &Record) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let command = record.command().to_string();
        let usage = self.commands.entry(command.clone()).or_default();
        usage.occurrences.push_back(seq);
        let line = usage
            .lines
            .entry(record.cmd_line.clone())
            .or_insert(LineUse {
                count: 0,
                last_seq: seq,
            });
        line.count += 1;
        line.last_seq = seq;

        self.history.push_back(HistoryEntry {
            command,
            cmd_line: record.cmd_line.clone(),
        });
        self.count_transition(self.history.len() - 1);

        if self.history_limit > 0 && self.history.len() > self.history_limit {
            self.evict_oldest();
        }
    }

    fn reset_history(&mut self) {
        self.next_seq = 0;
        self.history.clear();
        self.transitions.clear();
        self.commands.clear();
    }
}

//! Reader for recorded token-contract event traces.
//!
//! One event per line, whitespace separated, labels followed by values:
//!
//! ```text
//! Birth owner <addr> kittyId <id> matronId <id> sireId <id> genes <genes>
//! Pregnant owner <addr> matronId <id> sireId <id> cooldownEndBlock <height>
//! Transfer from <addr> to <addr> tokenId <id>
//! Approval from <addr> to <addr> tokenId <id>
//! ```
//!
//! The contract emits a `Transfer` for every newborn token right after its
//! `Birth`; that line is consumed together with the `Birth`.

use shardrun_types::{Method, ObjectKey, Operation, OperationId};
use std::collections::{HashMap, VecDeque};
use std::io::BufRead;
use thiserror::Error;

/// Ledger account address as it appears in traces.
pub type Address = [u8; 20];

/// Errors raised while reading a trace.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The underlying reader failed.
    #[error("failed to read trace: {0}")]
    Io(#[from] std::io::Error),

    /// The first word of a line is not a known event.
    #[error("line {line}: unknown event '{event}'")]
    UnknownEvent {
        /// 1-based line number.
        line: usize,
        /// The unrecognized event name.
        event: String,
    },

    /// A line is missing a field or a field does not parse.
    #[error("line {line}: {reason}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },

    /// A `Pregnant` event names a matron the breeder does not own.
    #[error("line {line}: 0x{owner} breeds token {token} it does not own")]
    NotOwner {
        /// 1-based line number.
        line: usize,
        /// Hex address of the breeder.
        owner: String,
        /// The matron token.
        token: u64,
    },
}

/// Turns a recorded trace into scheduler operations.
///
/// Tracks token owners (to decide when a sire needs an explicit siring
/// approval) and outstanding transfer approvals (a `Transfer` of an approved
/// token becomes `TransferFrom` and consumes the approval).
pub struct TraceReader<R> {
    lines: std::io::Lines<R>,
    line: usize,
    skip_lines: usize,
    next_id: u64,
    owners: HashMap<u64, Address>,
    /// (owner, token) -> approved spender.
    allowances: HashMap<(Address, u64), Address>,
    queued: VecDeque<Operation>,
}

impl<R: BufRead> TraceReader<R> {
    /// Create a reader over `reader`, starting at the first line.
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
            skip_lines: 0,
            next_id: 1,
            owners: HashMap::new(),
            allowances: HashMap::new(),
            queued: VecDeque::new(),
        }
    }

    /// Skip the first `n` lines of the trace.
    pub fn with_skip_lines(mut self, n: usize) -> Self {
        self.skip_lines = n;
        self
    }

    /// Number of lines consumed so far.
    pub fn line(&self) -> usize {
        self.line
    }

    fn next_line(&mut self) -> Result<Option<String>, TraceError> {
        while self.line < self.skip_lines {
            if self.lines.next().transpose()?.is_none() {
                return Ok(None);
            }
            self.line += 1;
        }
        loop {
            let Some(text) = self.lines.next().transpose()? else {
                return Ok(None);
            };
            self.line += 1;
            if !text.trim().is_empty() {
                return Ok(Some(text));
            }
        }
    }

    fn next_id(&mut self) -> OperationId {
        let id = OperationId(self.next_id);
        self.next_id += 1;
        id
    }

    fn parse(&mut self, text: &str) -> Result<(), TraceError> {
        let fields = Fields::new(self.line, text);
        match fields.event() {
            "Birth" => self.birth(&fields),
            "Pregnant" => self.pregnant(&fields),
            "Transfer" => self.transfer(&fields),
            "Approval" => self.approval(&fields),
            other => Err(TraceError::UnknownEvent {
                line: self.line,
                event: other.to_string(),
            }),
        }
    }

    fn birth(&mut self, fields: &Fields<'_>) -> Result<(), TraceError> {
        let owner = fields.address("owner")?;
        let kitty = fields.id("kittyId")?;
        let matron = fields.id("matronId")?;
        let sire = fields.id("sireId")?;
        let id = self.next_id();

        let operation = if matron == 0 && sire == 0 {
            Operation::creating(id, Method::Create, Vec::new(), ObjectKey::Id(kitty))
        } else {
            Operation::creating(
                id,
                Method::Birth,
                vec![ObjectKey::Id(matron), ObjectKey::Id(sire)],
                ObjectKey::Id(kitty),
            )
        };
        self.queued.push_back(operation.with_args(owner.to_vec()));
        self.owners.insert(kitty, owner);

        let birth_line = self.line;
        match self.next_line()? {
            Some(text) if text.split_whitespace().next() == Some("Transfer") => Ok(()),
            _ => Err(TraceError::Malformed {
                line: birth_line,
                reason: format!("Birth of {kitty} not followed by its Transfer"),
            }),
        }
    }

    fn pregnant(&mut self, fields: &Fields<'_>) -> Result<(), TraceError> {
        let owner = fields.address("owner")?;
        let matron = fields.id("matronId")?;
        let sire = fields.id("sireId")?;

        if let Some(known) = self.owners.get(&matron) {
            if *known != owner {
                return Err(TraceError::NotOwner {
                    line: self.line,
                    owner: hex::encode(owner),
                    token: matron,
                });
            }
        }

        if self.owners.get(&sire) != Some(&owner) {
            let id = self.next_id();
            self.queued.push_back(
                Operation::new(id, Method::ApproveSiring, vec![ObjectKey::Id(sire)])
                    .with_args(owner.to_vec()),
            );
        }

        let id = self.next_id();
        self.queued.push_back(
            Operation::new(
                id,
                Method::Breed,
                vec![ObjectKey::Id(matron), ObjectKey::Id(sire)],
            )
            .with_args(owner.to_vec()),
        );
        Ok(())
    }

    fn transfer(&mut self, fields: &Fields<'_>) -> Result<(), TraceError> {
        let from = fields.address("from")?;
        let to = fields.address("to")?;
        let token = fields.id("tokenId")?;
        let id = self.next_id();

        let operation = match self.allowances.remove(&(from, token)) {
            Some(_spender) => {
                let mut args = from.to_vec();
                args.extend_from_slice(&to);
                Operation::new(id, Method::TransferFrom, vec![ObjectKey::Id(token)]).with_args(args)
            }
            None => {
                Operation::new(id, Method::Transfer, vec![ObjectKey::Id(token)]).with_args(to.to_vec())
            }
        };
        self.queued.push_back(operation);
        self.owners.insert(token, to);
        Ok(())
    }

    fn approval(&mut self, fields: &Fields<'_>) -> Result<(), TraceError> {
        let from = fields.address("from")?;
        let to = fields.address("to")?;
        let token = fields.id("tokenId")?;
        let id = self.next_id();

        self.allowances.insert((from, token), to);
        self.queued.push_back(
            Operation::new(id, Method::Approve, vec![ObjectKey::Id(token)]).with_args(to.to_vec()),
        );
        Ok(())
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = Result<Operation, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(operation) = self.queued.pop_front() {
                return Some(Ok(operation));
            }
            let text = match self.next_line() {
                Ok(Some(text)) => text,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };
            if let Err(e) = self.parse(&text) {
                return Some(Err(e));
            }
        }
    }
}

/// Labelled fields of one trace line.
struct Fields<'a> {
    line: usize,
    parts: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn new(line: usize, text: &'a str) -> Self {
        Self {
            line,
            parts: text.split_whitespace().collect(),
        }
    }

    fn event(&self) -> &'a str {
        self.parts.first().copied().unwrap_or("")
    }

    fn value(&self, label: &str) -> Result<&'a str, TraceError> {
        self.parts
            .iter()
            .skip(1)
            .position(|part| *part == label)
            .and_then(|i| self.parts.get(i + 2))
            .copied()
            .ok_or_else(|| self.malformed(format!("missing {label}")))
    }

    fn id(&self, label: &str) -> Result<u64, TraceError> {
        let value = self.value(label)?;
        value
            .parse()
            .map_err(|_| self.malformed(format!("{label} '{value}' is not an integer")))
    }

    fn address(&self, label: &str) -> Result<Address, TraceError> {
        let value = self.value(label)?;
        parse_address(value).ok_or_else(|| self.malformed(format!("{label} '{value}' is not an address")))
    }

    fn malformed(&self, reason: String) -> TraceError {
        TraceError::Malformed {
            line: self.line,
            reason,
        }
    }
}

/// Parse a hex address, left-padding short values with zeros.
fn parse_address(value: &str) -> Option<Address> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if digits.is_empty() || digits.len() > 40 {
        return None;
    }
    let padded = format!("{digits:0>40}");
    let bytes = hex::decode(padded).ok()?;
    let mut address = [0u8; 20];
    address.copy_from_slice(&bytes);
    Some(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const ALICE: &str = "0x00000000000000000000000000000000000000a1";
    const BOB: &str = "0x00000000000000000000000000000000000000b2";

    fn read(trace: &str) -> Vec<Operation> {
        TraceReader::new(Cursor::new(trace.to_string()))
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn keys(operation: &Operation) -> Vec<u64> {
        operation
            .keys
            .iter()
            .map(|key| match key {
                ObjectKey::Id(id) => *id,
                ObjectKey::Address(_) => panic!("unexpected address key"),
            })
            .collect()
    }

    #[test]
    fn test_promo_birth_becomes_create() {
        let trace = format!(
            "Birth owner {ALICE} kittyId 7 matronId 0 sireId 0 genes 99\n\
             Transfer from 0x0 to {ALICE} tokenId 7\n"
        );
        let operations = read(&trace);

        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].method, Method::Create);
        assert_eq!(keys(&operations[0]), vec![7]);
        assert_eq!(operations[0].creates, Some(ObjectKey::Id(7)));
    }

    #[test]
    fn test_birth_with_parents_depends_on_them() {
        let trace = format!(
            "Birth owner {ALICE} kittyId 9 matronId 3 sireId 4 genes 1\n\
             Transfer from 0x0 to {ALICE} tokenId 9\n"
        );
        let operations = read(&trace);

        assert_eq!(operations[0].method, Method::Birth);
        assert_eq!(keys(&operations[0]), vec![3, 4, 9]);
    }

    #[test]
    fn test_pregnant_with_foreign_sire_requests_approval() {
        let trace = format!(
            "Birth owner {ALICE} kittyId 1 matronId 0 sireId 0 genes 1\n\
             Transfer from 0x0 to {ALICE} tokenId 1\n\
             Birth owner {BOB} kittyId 2 matronId 0 sireId 0 genes 2\n\
             Transfer from 0x0 to {BOB} tokenId 2\n\
             Pregnant owner {ALICE} matronId 1 sireId 2 cooldownEndBlock 40\n"
        );
        let methods: Vec<Method> = read(&trace).iter().map(|op| op.method).collect();

        assert_eq!(
            methods,
            vec![Method::Create, Method::Create, Method::ApproveSiring, Method::Breed]
        );
    }

    #[test]
    fn test_pregnant_with_own_sire_breeds_directly() {
        let trace = format!(
            "Birth owner {ALICE} kittyId 1 matronId 0 sireId 0 genes 1\n\
             Transfer from 0x0 to {ALICE} tokenId 1\n\
             Birth owner {ALICE} kittyId 2 matronId 0 sireId 0 genes 2\n\
             Transfer from 0x0 to {ALICE} tokenId 2\n\
             Pregnant owner {ALICE} matronId 1 sireId 2 cooldownEndBlock 40\n"
        );
        let operations = read(&trace);

        assert_eq!(operations.len(), 3);
        assert_eq!(operations[2].method, Method::Breed);
        assert_eq!(keys(&operations[2]), vec![1, 2]);
    }

    #[test]
    fn test_approved_transfer_becomes_transfer_from_once() {
        let trace = format!(
            "Approval from {ALICE} to {BOB} tokenId 5\n\
             Transfer from {ALICE} to {BOB} tokenId 5\n\
             Transfer from {BOB} to {ALICE} tokenId 5\n"
        );
        let methods: Vec<Method> = read(&trace).iter().map(|op| op.method).collect();

        assert_eq!(
            methods,
            vec![Method::Approve, Method::TransferFrom, Method::Transfer]
        );
    }

    #[test]
    fn test_operation_ids_are_sequential() {
        let trace = format!(
            "Transfer from {ALICE} to {BOB} tokenId 5\n\
             \n\
             Transfer from {BOB} to {ALICE} tokenId 6\n"
        );
        let ids: Vec<u64> = read(&trace).iter().map(|op| op.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_skip_lines() {
        let trace = format!(
            "header line\n\
             Transfer from {ALICE} to {BOB} tokenId 5\n"
        );
        let operations: Vec<_> = TraceReader::new(Cursor::new(trace))
            .with_skip_lines(1)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(operations.len(), 1);
    }

    #[test]
    fn test_unknown_event_names_line() {
        let trace = format!(
            "Transfer from {ALICE} to {BOB} tokenId 5\n\
             AuctionCreated tokenId 5\n"
        );
        let mut reader = TraceReader::new(Cursor::new(trace));
        assert!(reader.next().unwrap().is_ok());

        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err, TraceError::UnknownEvent { line: 2, .. }));
    }

    #[test]
    fn test_breeding_unowned_matron_is_rejected() {
        let trace = format!(
            "Birth owner {ALICE} kittyId 1 matronId 0 sireId 0 genes 1\n\
             Transfer from 0x0 to {ALICE} tokenId 1\n\
             Pregnant owner {BOB} matronId 1 sireId 2 cooldownEndBlock 40\n"
        );
        let result: Result<Vec<_>, _> = TraceReader::new(Cursor::new(trace)).collect();
        assert!(matches!(result, Err(TraceError::NotOwner { token: 1, .. })));
    }

    #[test]
    fn test_malformed_fields() {
        let trace = format!("Transfer from {ALICE} to {BOB} tokenId five\n");
        let result: Result<Vec<_>, _> = TraceReader::new(Cursor::new(trace)).collect();
        assert!(matches!(result, Err(TraceError::Malformed { line: 1, .. })));

        assert_eq!(parse_address("0x1").map(|a| a[19]), Some(1));
        assert!(parse_address("0xzz").is_none());
    }
}

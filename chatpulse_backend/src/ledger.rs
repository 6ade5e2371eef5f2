//! Money movement between the user and characters: one-shot transfers and
//! group red packets. Every operation runs inside a single transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::database::{parse_rfc3339, TenantDatabase, USER_ID};
use crate::dice::Dice;

pub const MIN_SHARE: f64 = 0.01;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("amount must be at least 0.01")]
    InvalidAmount,
    #[error("red packet count must be at least 1 and leave 0.01 per share")]
    InvalidCount,
    #[error("insufficient funds: balance {balance:.2}, needed {needed:.2}")]
    InsufficientFunds { balance: f64, needed: f64 },
    #[error("transfer {0} was already resolved")]
    AlreadyResolved(i64),
    #[error("only the recipient can claim transfer {0}")]
    NotRecipient(i64),
    #[error("{claimer} already claimed red packet {packet}")]
    AlreadyClaimed { packet: i64, claimer: String },
    #[error("red packet {0} has no shares left")]
    Exhausted(i64),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedPacketKind {
    /// Random split; every share is at least 0.01.
    Lucky,
    /// Every claimer receives `total / count`.
    Fixed,
}

impl RedPacketKind {
    fn as_db_str(self) -> &'static str {
        match self {
            RedPacketKind::Lucky => "lucky",
            RedPacketKind::Fixed => "fixed",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw {
            "fixed" => RedPacketKind::Fixed,
            _ => RedPacketKind::Lucky,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: i64,
    pub sender_id: String,
    pub recipient_id: String,
    pub room_id: String,
    pub amount: f64,
    pub note: String,
    pub claimed: bool,
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedPacketClaim {
    pub claimer_id: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedPacket {
    pub id: i64,
    pub room_id: String,
    pub sender_id: String,
    pub kind: RedPacketKind,
    pub count: u32,
    pub total_amount: f64,
    pub note: String,
    pub claims: Vec<RedPacketClaim>,
    pub created_at: DateTime<Utc>,
}

impl RedPacket {
    pub fn claimed_total(&self) -> f64 {
        round_cents(self.claims.iter().map(|c| c.amount).sum())
    }

    pub fn remaining(&self) -> f64 {
        round_cents(self.total_amount - self.claimed_total())
    }

    pub fn shares_left(&self) -> u32 {
        self.count.saturating_sub(self.claims.len() as u32)
    }
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Display marker stored in place of a red packet message.
pub fn red_packet_marker(packet_id: i64) -> String {
    format!("[REDPACKET:{}]", packet_id)
}

/// Display marker stored in place of a transfer message.
pub fn transfer_marker(transfer: &Transfer) -> String {
    format!(
        "[TRANSFER]{}|{:.2}|{}",
        transfer.id, transfer.amount, transfer.note
    )
}

// ---- balances ----

pub(crate) fn balance(conn: &Connection, account_id: &str) -> LedgerResult<f64> {
    let value = if account_id == USER_ID {
        conn.query_row("SELECT wallet FROM user_profile WHERE id = 1", [], |row| {
            row.get::<_, f64>(0)
        })
        .optional()?
    } else {
        conn.query_row(
            "SELECT wallet FROM characters WHERE id = ?1",
            [account_id],
            |row| row.get::<_, f64>(0),
        )
        .optional()?
    };
    value.ok_or_else(|| LedgerError::NotFound(format!("account '{}'", account_id)))
}

fn set_balance(conn: &Connection, account_id: &str, value: f64) -> LedgerResult<()> {
    let value = round_cents(value.max(0.0));
    if account_id == USER_ID {
        conn.execute("UPDATE user_profile SET wallet = ?1 WHERE id = 1", [value])?;
    } else {
        conn.execute(
            "UPDATE characters SET wallet = ?2 WHERE id = ?1",
            params![account_id, value],
        )?;
    }
    Ok(())
}

fn debit(conn: &Connection, account_id: &str, amount: f64) -> LedgerResult<f64> {
    let current = balance(conn, account_id)?;
    if current + 1e-9 < amount {
        return Err(LedgerError::InsufficientFunds {
            balance: current,
            needed: amount,
        });
    }
    let next = round_cents(current - amount);
    set_balance(conn, account_id, next)?;
    Ok(next)
}

fn credit(conn: &Connection, account_id: &str, amount: f64) -> LedgerResult<f64> {
    let next = round_cents(balance(conn, account_id)? + amount);
    set_balance(conn, account_id, next)?;
    Ok(next)
}

// ---- transfers ----

/// Debits the sender and records an unresolved transfer.
pub(crate) fn create_transfer(
    conn: &Connection,
    sender_id: &str,
    recipient_id: &str,
    room_id: &str,
    amount: f64,
    note: &str,
) -> LedgerResult<Transfer> {
    let amount = round_cents(amount);
    if !amount.is_finite() || amount < MIN_SHARE {
        return Err(LedgerError::InvalidAmount);
    }
    debit(conn, sender_id, amount)?;

    let created_at = Utc::now();
    conn.execute(
        "INSERT INTO transfers (sender_id, recipient_id, room_id, amount, note, claimed, refunded, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6)",
        params![sender_id, recipient_id, room_id, amount, note, created_at.to_rfc3339()],
    )?;

    Ok(Transfer {
        id: conn.last_insert_rowid(),
        sender_id: sender_id.to_string(),
        recipient_id: recipient_id.to_string(),
        room_id: room_id.to_string(),
        amount,
        note: note.to_string(),
        claimed: false,
        refunded: false,
        created_at,
    })
}

fn load_transfer(conn: &Connection, id: i64) -> LedgerResult<Transfer> {
    conn.query_row(
        "SELECT id, sender_id, recipient_id, room_id, amount, note, claimed, refunded, created_at
         FROM transfers WHERE id = ?1",
        [id],
        |row| {
            Ok(Transfer {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                recipient_id: row.get(2)?,
                room_id: row.get(3)?,
                amount: row.get(4)?,
                note: row.get(5)?,
                claimed: row.get(6)?,
                refunded: row.get(7)?,
                created_at: parse_rfc3339(row.get::<_, String>(8)?, 8)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| LedgerError::NotFound(format!("transfer {}", id)))
}

fn resolve_transfer(db: &TenantDatabase, id: i64, claimant: Option<&str>) -> LedgerResult<Transfer> {
    run_in_transaction(db, |tx| resolve_transfer_in(tx, id, claimant))
}

fn resolve_transfer_in(conn: &Connection, id: i64, claimant: Option<&str>) -> LedgerResult<Transfer> {
    let mut transfer = load_transfer(conn, id)?;
    if transfer.claimed || transfer.refunded {
        return Err(LedgerError::AlreadyResolved(id));
    }
    match claimant {
        Some(claimer) => {
            if claimer != transfer.recipient_id {
                return Err(LedgerError::NotRecipient(id));
            }
            credit(conn, &transfer.recipient_id, transfer.amount)?;
            conn.execute("UPDATE transfers SET claimed = 1 WHERE id = ?1", [id])?;
            transfer.claimed = true;
        }
        None => {
            credit(conn, &transfer.sender_id, transfer.amount)?;
            conn.execute("UPDATE transfers SET refunded = 1 WHERE id = ?1", [id])?;
            transfer.refunded = true;
        }
    }
    Ok(transfer)
}

pub fn send_transfer(
    db: &TenantDatabase,
    sender_id: &str,
    recipient_id: &str,
    room_id: &str,
    amount: f64,
    note: &str,
) -> LedgerResult<Transfer> {
    run_in_transaction(db, |tx| {
        create_transfer(tx, sender_id, recipient_id, room_id, amount, note)
    })
}

/// Credits the recipient. Rejected once the transfer is claimed or refunded.
pub fn claim_transfer(db: &TenantDatabase, id: i64, claimer_id: &str) -> LedgerResult<Transfer> {
    resolve_transfer(db, id, Some(claimer_id))
}

/// Returns the money to the sender. Rejected once the transfer is resolved.
pub fn refund_transfer(db: &TenantDatabase, id: i64) -> LedgerResult<Transfer> {
    resolve_transfer(db, id, None)
}

pub fn get_transfer(db: &TenantDatabase, id: i64) -> LedgerResult<Transfer> {
    run_in_transaction(db, |tx| load_transfer(tx, id))
}

// ---- red packets ----

pub fn send_red_packet(
    db: &TenantDatabase,
    room_id: &str,
    sender_id: &str,
    kind: RedPacketKind,
    count: u32,
    amount: f64,
    note: &str,
) -> LedgerResult<RedPacket> {
    let total = round_cents(amount);
    if !total.is_finite() || total < MIN_SHARE {
        return Err(LedgerError::InvalidAmount);
    }
    if count == 0 || total + 1e-9 < MIN_SHARE * count as f64 {
        return Err(LedgerError::InvalidCount);
    }

    run_in_transaction(db, |tx| {
        debit(tx, sender_id, total)?;
        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO red_packets (room_id, sender_id, kind, count, total_amount, note, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                room_id,
                sender_id,
                kind.as_db_str(),
                count,
                total,
                note,
                created_at.to_rfc3339()
            ],
        )?;
        Ok(RedPacket {
            id: tx.last_insert_rowid(),
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            kind,
            count,
            total_amount: total,
            note: note.to_string(),
            claims: Vec::new(),
            created_at,
        })
    })
}

pub fn get_red_packet(db: &TenantDatabase, id: i64) -> LedgerResult<RedPacket> {
    run_in_transaction(db, |tx| load_red_packet(tx, id))
}

/// Claims one share for `claimer_id` and credits it.
pub fn claim_red_packet(
    db: &TenantDatabase,
    id: i64,
    claimer_id: &str,
    dice: &dyn Dice,
) -> LedgerResult<(RedPacket, f64)> {
    run_in_transaction(db, |tx| {
        let mut packet = load_red_packet(tx, id)?;
        if packet.claims.iter().any(|c| c.claimer_id == claimer_id) {
            return Err(LedgerError::AlreadyClaimed {
                packet: id,
                claimer: claimer_id.to_string(),
            });
        }
        let shares_left = packet.shares_left();
        let remaining = packet.remaining();
        if shares_left == 0 || remaining < MIN_SHARE {
            return Err(LedgerError::Exhausted(id));
        }

        let share = next_share(packet.kind, packet.total_amount, packet.count, remaining, shares_left, dice);
        tx.execute(
            "INSERT INTO red_packet_claims (packet_id, claimer_id, amount, claimed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, claimer_id, share, Utc::now().to_rfc3339()],
        )?;
        credit(tx, claimer_id, share)?;

        packet.claims.push(RedPacketClaim {
            claimer_id: claimer_id.to_string(),
            amount: share,
        });
        Ok((packet, share))
    })
}

/// Next share size. The last share takes whatever is left so the packet
/// always drains exactly; earlier lucky shares leave 0.01 for each remaining
/// claimer.
fn next_share(
    kind: RedPacketKind,
    total: f64,
    count: u32,
    remaining: f64,
    shares_left: u32,
    dice: &dyn Dice,
) -> f64 {
    if shares_left <= 1 {
        return round_cents(remaining);
    }
    let reserved = MIN_SHARE * (shares_left - 1) as f64;
    let ceiling = round_cents(remaining - reserved).max(MIN_SHARE);
    let share = match kind {
        RedPacketKind::Fixed => round_cents(total / count as f64),
        RedPacketKind::Lucky => {
            // Double-mean bound keeps the expected share equal to remaining / shares_left
            let upper = (2.0 * remaining / shares_left as f64).min(ceiling);
            round_cents(dice.uniform(MIN_SHARE, upper))
        }
    };
    share.max(MIN_SHARE).min(ceiling)
}

fn load_red_packet(conn: &Connection, id: i64) -> LedgerResult<RedPacket> {
    let mut packet = conn
        .query_row(
            "SELECT id, room_id, sender_id, kind, count, total_amount, note, created_at
             FROM red_packets WHERE id = ?1",
            [id],
            |row| {
                Ok(RedPacket {
                    id: row.get(0)?,
                    room_id: row.get(1)?,
                    sender_id: row.get(2)?,
                    kind: RedPacketKind::from_db(&row.get::<_, String>(3)?),
                    count: row.get(4)?,
                    total_amount: row.get(5)?,
                    note: row.get(6)?,
                    claims: Vec::new(),
                    created_at: parse_rfc3339(row.get::<_, String>(7)?, 7)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| LedgerError::NotFound(format!("red packet {}", id)))?;

    let mut stmt = conn.prepare(
        "SELECT claimer_id, amount FROM red_packet_claims WHERE packet_id = ?1 ORDER BY claimed_at ASC",
    )?;
    packet.claims = stmt
        .query_map([id], |row| {
            Ok(RedPacketClaim {
                claimer_id: row.get(0)?,
                amount: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(packet)
}

/// Runs a ledger operation in one transaction, keeping its typed error.
fn run_in_transaction<T>(
    db: &TenantDatabase,
    op: impl FnOnce(&Connection) -> LedgerResult<T>,
) -> LedgerResult<T> {
    let mut outcome = None;
    let committed = db.with_transaction(|tx| match op(tx) {
        Ok(value) => {
            outcome = Some(value);
            Ok(())
        }
        Err(error) => Err(anyhow::Error::new(error)),
    });
    match committed {
        Ok(()) => outcome.ok_or_else(|| LedgerError::Other(anyhow::anyhow!("ledger op produced no value"))),
        Err(error) => match error.downcast::<LedgerError>() {
            Ok(ledger) => Err(ledger),
            Err(other) => Err(LedgerError::Other(other)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Character;
    use crate::test_support::FixedDice;

    fn seeded_db() -> TenantDatabase {
        let db = TenantDatabase::in_memory().expect("db init");
        for id in ["a", "b", "c", "d"] {
            db.upsert_character(&Character {
                id: id.to_string(),
                name: id.to_uppercase(),
                wallet: 10.0,
                ..Character::default()
            })
            .expect("seed character");
        }
        db
    }

    #[test]
    fn red_packet_rejects_extra_and_duplicate_claims() {
        let db = seeded_db();
        let dice = FixedDice::default();
        let packet = send_red_packet(&db, "room", USER_ID, RedPacketKind::Lucky, 3, 1.0, "gl")
            .expect("send");
        assert_eq!(db.get_profile().expect("profile").wallet, 99.0);

        let (_, first) = claim_red_packet(&db, packet.id, "a", &dice).expect("a claims");
        assert!(first >= MIN_SHARE);
        assert!(matches!(
            claim_red_packet(&db, packet.id, "a", &dice),
            Err(LedgerError::AlreadyClaimed { .. })
        ));
        claim_red_packet(&db, packet.id, "b", &dice).expect("b claims");
        let (packet_after, _) = claim_red_packet(&db, packet.id, "c", &dice).expect("c claims");
        assert!(matches!(
            claim_red_packet(&db, packet.id, "d", &dice),
            Err(LedgerError::Exhausted(_))
        ));

        assert_eq!(packet_after.claims.len(), 3);
        assert!((packet_after.claimed_total() - 1.0).abs() < 1e-9);
        assert!(packet_after.claims.iter().all(|c| c.amount >= MIN_SHARE));
    }

    #[test]
    fn fixed_packet_pays_equal_shares() {
        let db = seeded_db();
        let dice = FixedDice::default();
        let packet = send_red_packet(&db, "room", USER_ID, RedPacketKind::Fixed, 3, 10.0, "")
            .expect("send");
        assert_eq!(packet.total_amount, 10.0);
        assert_eq!(db.get_profile().expect("profile").wallet, 90.0);

        let (_, first) = claim_red_packet(&db, packet.id, "a", &dice).expect("a claims");
        assert_eq!(first, 3.33);
        assert_eq!(db.get_character("a").expect("load").expect("a").wallet, 13.33);
        claim_red_packet(&db, packet.id, "b", &dice).expect("b claims");
        // The last share takes the leftover cent
        let (after, last) = claim_red_packet(&db, packet.id, "c", &dice).expect("c claims");
        assert_eq!(last, 3.34);
        let paid: f64 = after.claims.iter().map(|c| c.amount).sum();
        assert!((paid - 10.0).abs() < 1e-9);
    }

    #[test]
    fn red_packet_needs_funds_and_valid_count() {
        let db = seeded_db();
        assert!(matches!(
            send_red_packet(&db, "room", USER_ID, RedPacketKind::Lucky, 2, 500.0, ""),
            Err(LedgerError::InsufficientFunds { .. })
        ));
        assert!(matches!(
            send_red_packet(&db, "room", USER_ID, RedPacketKind::Lucky, 10, 0.05, ""),
            Err(LedgerError::InvalidCount)
        ));
        assert_eq!(db.get_profile().expect("profile").wallet, 100.0);
    }

    #[test]
    fn transfer_resolves_exactly_once() {
        let db = seeded_db();
        let transfer = send_transfer(&db, "a", USER_ID, "a", 5.2, "coffee").expect("send");
        assert_eq!(db.get_character("a").expect("load").expect("a").wallet, 4.8);

        assert!(matches!(
            claim_transfer(&db, transfer.id, "b"),
            Err(LedgerError::NotRecipient(_))
        ));
        let claimed = claim_transfer(&db, transfer.id, USER_ID).expect("claim");
        assert!(claimed.claimed);
        assert_eq!(db.get_profile().expect("profile").wallet, 105.2);

        assert!(matches!(
            refund_transfer(&db, transfer.id),
            Err(LedgerError::AlreadyResolved(_))
        ));
        assert!(matches!(
            claim_transfer(&db, transfer.id, USER_ID),
            Err(LedgerError::AlreadyResolved(_))
        ));
    }

    #[test]
    fn refund_returns_money_to_sender() {
        let db = seeded_db();
        let transfer = send_transfer(&db, USER_ID, "b", "b", 20.0, "").expect("send");
        assert_eq!(db.get_profile().expect("profile").wallet, 80.0);
        refund_transfer(&db, transfer.id).expect("refund");
        assert_eq!(db.get_profile().expect("profile").wallet, 100.0);
        assert!(get_transfer(&db, transfer.id).expect("load").refunded);
    }
}

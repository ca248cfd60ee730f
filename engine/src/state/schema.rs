//! Record families and key layout for the engine's keyed store
//!
//! Each family is a logically separate keyspace. Keys are prefixed so that a
//! prefix scan returns every record of one ticket in insertion order.

/// Family for ticket views
pub const FAMILY_TICKETS: &str = "tickets";

/// Family for the ticket-number index
pub const FAMILY_TICKET_NUMBERS: &str = "ticket_numbers";

/// Family for assignment history
pub const FAMILY_ASSIGNMENTS: &str = "assignments";

/// Family for SLA trackings
pub const FAMILY_TRACKINGS: &str = "trackings";

/// All family names
pub const ALL_FAMILIES: &[&str] = &[
    FAMILY_TICKETS,
    FAMILY_TICKET_NUMBERS,
    FAMILY_ASSIGNMENTS,
    FAMILY_TRACKINGS,
];

/// Key builders for compound keys
pub mod keys {
    use std::borrow::Cow;

    /// Escape `:` (and `%`) in an ID used as a compound-key segment, so one
    /// ticket's prefix never covers another ticket's records
    pub fn segment(id: &str) -> Cow<'_, str> {
        if id.contains([':', '%']) {
            Cow::Owned(id.replace('%', "%25").replace(':', "%3A"))
        } else {
            Cow::Borrowed(id)
        }
    }

    /// Key of a ticket view
    pub fn ticket(ticket_id: &str) -> String {
        format!("ticket:{}", ticket_id)
    }

    /// Key of a ticket-number index entry
    pub fn ticket_number(ticket_number: &str) -> String {
        format!("tnum:{}", ticket_number)
    }

    /// Prefix covering every assignment of a ticket
    pub fn assignment_prefix(ticket_id: &str) -> String {
        format!("asg:{}:", segment(ticket_id))
    }

    /// Key of one assignment (sequence keeps history ordered)
    pub fn assignment(ticket_id: &str, seq: u32) -> String {
        format!("asg:{}:{:06}", segment(ticket_id), seq)
    }

    /// Key of an SLA tracking
    pub fn tracking(ticket_id: &str) -> String {
        format!("sla:{}", ticket_id)
    }

    /// Parse the sequence number from an assignment key
    pub fn parse_assignment_seq(key: &str) -> Option<u32> {
        let (prefix, seq) = key.rsplit_once(':')?;
        if prefix.starts_with("asg:") {
            seq.parse().ok()
        } else {
            None
        }
    }
}

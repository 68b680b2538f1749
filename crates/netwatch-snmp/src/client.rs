//! SNMPv2c queries: system group and interface counters

use async_trait::async_trait;
use netwatch_core::CounterWidth;
use serde::{Deserialize, Serialize};
use snmp2::{AsyncSession, Oid, Value};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::oid;

/// Default timeout per request
pub const DEFAULT_TIMEOUT_MS: u64 = 1500;

/// Upper bound on rows read from one table column
pub const MAX_WALK_ROWS: usize = 512;

/// Longest system description kept
const MAX_DESCRIPTION_CHARS: usize = 200;

#[derive(Error, Debug)]
pub enum SnmpError {
    #[error("no SNMP answer from {0}")]
    Timeout(IpAddr),
    #[error("failed to open SNMP session to {0}: {1}")]
    Session(IpAddr, String),
    #[error("SNMP request to {0} failed: {1}")]
    Request(IpAddr, String),
    #[error("invalid object identifier: {0}")]
    InvalidOid(String),
}

/// Session parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnmpConfig {
    pub community: String,
    pub port: u16,
    pub timeout: Duration,
}

impl Default for SnmpConfig {
    fn default() -> Self {
        Self {
            community: "public".to_string(),
            port: oid::SNMP_PORT,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// System group of a device. Every field is optional and independently sourced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub system_name: Option<String>,
    pub system_description: Option<String>,
    /// Agent uptime in seconds
    pub uptime: Option<u64>,
    pub contact: Option<String>,
    pub location: Option<String>,
    pub object_id: Option<String>,
}

impl SystemInfo {
    pub fn is_empty(&self) -> bool {
        self.system_name.is_none()
            && self.system_description.is_none()
            && self.uptime.is_none()
            && self.contact.is_none()
            && self.location.is_none()
            && self.object_id.is_none()
    }
}

/// One row of the interface table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEntry {
    pub if_index: u32,
    pub if_descr: Option<String>,
    /// Nominal speed in bits per second
    pub if_speed: Option<u64>,
    pub in_octets: u64,
    pub out_octets: u64,
    pub counter_width: CounterWidth,
}

/// Management-protocol queries against one device
#[async_trait]
pub trait ManagementClient: Send + Sync {
    async fn identify(&self, address: IpAddr) -> Result<SystemInfo, SnmpError>;

    async fn interface_table(&self, address: IpAddr) -> Result<Vec<InterfaceEntry>, SnmpError>;
}

/// Decoded variable binding value, detached from the response buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scalar {
    Text(String),
    Number(u64),
    Counter32(u32),
    Counter64(u64),
    Ticks(u32),
    ObjectId(String),
    EndOfView,
    Absent,
}

impl Scalar {
    fn from_value(value: &Value<'_>) -> Self {
        match value {
            Value::OctetString(bytes) => Scalar::Text(String::from_utf8_lossy(bytes).into_owned()),
            Value::Integer(n) => u64::try_from(*n).map_or(Scalar::Absent, Scalar::Number),
            Value::Unsigned32(n) => Scalar::Number(u64::from(*n)),
            Value::Counter32(n) => Scalar::Counter32(*n),
            Value::Counter64(n) => Scalar::Counter64(*n),
            Value::Timeticks(t) => Scalar::Ticks(*t),
            Value::ObjectIdentifier(oid) => Scalar::ObjectId(oid.to_id_string()),
            Value::EndOfMibView => Scalar::EndOfView,
            _ => Scalar::Absent,
        }
    }

    fn text(self) -> Option<String> {
        match self {
            Scalar::Text(s) => clean_text(&s),
            _ => None,
        }
    }

    fn number(&self) -> Option<u64> {
        match self {
            Scalar::Number(n) | Scalar::Counter64(n) => Some(*n),
            Scalar::Counter32(n) | Scalar::Ticks(n) => Some(u64::from(*n)),
            _ => None,
        }
    }
}

/// Trim, drop control characters and cap length; empty becomes `None`
fn clean_text(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string();
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.chars().count() > MAX_DESCRIPTION_CHARS {
        let truncated: String = cleaned.chars().take(MAX_DESCRIPTION_CHARS).collect();
        return Some(format!("{}...", truncated));
    }
    Some(cleaned)
}

/// SNMPv2c client. Opens a fresh session per call; sessions are dropped on
/// return or cancellation.
#[derive(Debug, Clone, Default)]
pub struct SnmpClient {
    config: SnmpConfig,
}

impl SnmpClient {
    pub fn new(config: SnmpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SnmpConfig {
        &self.config
    }

    async fn session(&self, address: IpAddr) -> Result<AsyncSession, SnmpError> {
        let target = SocketAddr::new(address, self.config.port).to_string();
        match timeout(
            self.config.timeout,
            AsyncSession::new_v2c(&target, self.config.community.as_bytes(), 0),
        )
        .await
        {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(SnmpError::Session(address, e.to_string())),
            Err(_) => Err(SnmpError::Timeout(address)),
        }
    }

    async fn get(
        &self,
        session: &mut AsyncSession,
        address: IpAddr,
        arcs: &[u64],
    ) -> Result<Scalar, SnmpError> {
        let oid = to_oid(arcs)?;
        let mut response = match timeout(self.config.timeout, session.get(&oid)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(SnmpError::Request(address, format!("{:?}", e))),
            Err(_) => return Err(SnmpError::Timeout(address)),
        };
        Ok(response
            .varbinds
            .next()
            .map_or(Scalar::Absent, |(_, value)| Scalar::from_value(&value)))
    }

    /// GETNEXT walk of a single table column, returning `(row index, value)`
    async fn walk(
        &self,
        session: &mut AsyncSession,
        address: IpAddr,
        column: &[u64],
    ) -> Result<Vec<(u32, Scalar)>, SnmpError> {
        let mut rows = Vec::new();
        let mut cursor = column.to_vec();

        while rows.len() < MAX_WALK_ROWS {
            let request = to_oid(&cursor)?;
            let mut response = match timeout(self.config.timeout, session.getnext(&request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(SnmpError::Request(address, format!("{:?}", e))),
                Err(_) => return Err(SnmpError::Timeout(address)),
            };
            let Some((name, value)) = response.varbinds.next() else {
                break;
            };
            let name = name.to_id_string();
            let value = Scalar::from_value(&value);

            if value == Scalar::EndOfView {
                break;
            }
            let Some(arcs) = oid::parse_dotted(&name) else {
                break;
            };
            // past the column, or an agent that does not advance
            let Some(index) = oid::column_index(column, &arcs) else {
                break;
            };
            if arcs <= cursor {
                break;
            }

            trace!(ip = %address, oid = %name, ?value, "Walk row");
            rows.push((index, value));
            cursor = arcs;
        }

        Ok(rows)
    }
}

fn to_oid(arcs: &[u64]) -> Result<Oid<'static>, SnmpError> {
    Oid::from(arcs).map_err(|e| SnmpError::InvalidOid(format!("{} ({:?})", oid::format_dotted(arcs), e)))
}

#[async_trait]
impl ManagementClient for SnmpClient {
    async fn identify(&self, address: IpAddr) -> Result<SystemInfo, SnmpError> {
        let mut session = self.session(address).await?;
        let mut info = SystemInfo::default();

        // the first request decides whether an agent is there at all
        info.system_description = self.get(&mut session, address, oid::SYS_DESCR).await?.text();

        for arcs in [
            oid::SYS_NAME,
            oid::SYS_UPTIME,
            oid::SYS_CONTACT,
            oid::SYS_LOCATION,
            oid::SYS_OBJECT_ID,
        ] {
            let value = match self.get(&mut session, address, arcs).await {
                Ok(value) => value,
                Err(e) => {
                    debug!(ip = %address, oid = %oid::format_dotted(arcs), error = %e, "SNMP get failed");
                    continue;
                }
            };
            match arcs {
                a if a == oid::SYS_NAME => info.system_name = value.text(),
                a if a == oid::SYS_UPTIME => {
                    // Timeticks are hundredths of a second
                    info.uptime = match value {
                        Scalar::Ticks(t) => Some(u64::from(t) / 100),
                        _ => None,
                    }
                }
                a if a == oid::SYS_CONTACT => info.contact = value.text(),
                a if a == oid::SYS_LOCATION => info.location = value.text(),
                _ => {
                    info.object_id = match value {
                        Scalar::ObjectId(id) => Some(id),
                        _ => None,
                    }
                }
            }
        }

        debug!(ip = %address, name = ?info.system_name, "SNMP identify complete");
        Ok(info)
    }

    async fn interface_table(&self, address: IpAddr) -> Result<Vec<InterfaceEntry>, SnmpError> {
        let mut session = self.session(address).await?;

        let in_octets = self.walk(&mut session, address, oid::IF_IN_OCTETS).await?;
        let out_octets = self.walk(&mut session, address, oid::IF_OUT_OCTETS).await?;
        let descr = self
            .walk(&mut session, address, oid::IF_DESCR)
            .await
            .unwrap_or_default();
        let speed = self
            .walk(&mut session, address, oid::IF_SPEED)
            .await
            .unwrap_or_default();

        // SNMPv1-only agents and some embedded stacks lack ifXTable
        let hc_in = match self.walk(&mut session, address, oid::IF_HC_IN_OCTETS).await {
            Ok(rows) => rows,
            Err(e) => {
                debug!(ip = %address, error = %e, "No 64-bit interface counters");
                Vec::new()
            }
        };
        let hc_out = if hc_in.is_empty() {
            Vec::new()
        } else {
            self.walk(&mut session, address, oid::IF_HC_OUT_OCTETS)
                .await
                .unwrap_or_default()
        };

        let table = assemble_interfaces(TableColumns {
            descr,
            speed,
            in_octets,
            out_octets,
            hc_in,
            hc_out,
        });
        debug!(ip = %address, interfaces = table.len(), "SNMP interface table read");
        Ok(table)
    }
}

pub(crate) struct TableColumns {
    pub descr: Vec<(u32, Scalar)>,
    pub speed: Vec<(u32, Scalar)>,
    pub in_octets: Vec<(u32, Scalar)>,
    pub out_octets: Vec<(u32, Scalar)>,
    pub hc_in: Vec<(u32, Scalar)>,
    pub hc_out: Vec<(u32, Scalar)>,
}

/// Join walked columns into rows. A row needs both directions of one counter
/// width; 64-bit counters are used only where both answer as Counter64.
pub(crate) fn assemble_interfaces(columns: TableColumns) -> Vec<InterfaceEntry> {
    let counters32 = |rows: Vec<(u32, Scalar)>| -> BTreeMap<u32, u64> {
        rows.into_iter()
            .filter_map(|(i, v)| match v {
                Scalar::Counter32(n) => Some((i, u64::from(n))),
                // some agents report plain unsigned values here
                Scalar::Number(n) if n <= u64::from(u32::MAX) => Some((i, n)),
                _ => None,
            })
            .collect()
    };
    let counters64 = |rows: Vec<(u32, Scalar)>| -> BTreeMap<u32, u64> {
        rows.into_iter()
            .filter_map(|(i, v)| match v {
                Scalar::Counter64(n) => Some((i, n)),
                _ => None,
            })
            .collect()
    };

    let in32 = counters32(columns.in_octets);
    let out32 = counters32(columns.out_octets);
    let in64 = counters64(columns.hc_in);
    let out64 = counters64(columns.hc_out);
    let mut descr: BTreeMap<u32, String> = columns
        .descr
        .into_iter()
        .filter_map(|(i, v)| v.text().map(|s| (i, s)))
        .collect();
    let speed: BTreeMap<u32, u64> = columns
        .speed
        .into_iter()
        .filter_map(|(i, v)| v.number().map(|n| (i, n)))
        .collect();

    let mut indices: Vec<u32> = in32.keys().chain(in64.keys()).copied().collect();
    indices.sort_unstable();
    indices.dedup();

    indices
        .into_iter()
        .filter_map(|if_index| {
            let (in_octets, out_octets, counter_width) =
                match (in64.get(&if_index), out64.get(&if_index)) {
                    (Some(&i), Some(&o)) => (i, o, CounterWidth::Bits64),
                    _ => (
                        *in32.get(&if_index)?,
                        *out32.get(&if_index)?,
                        CounterWidth::Bits32,
                    ),
                };
            Some(InterfaceEntry {
                if_index,
                if_descr: descr.remove(&if_index),
                if_speed: speed.get(&if_index).copied(),
                in_octets,
                out_octets,
                counter_width,
            })
        })
        .collect()
}

//----------------------------------------------------------------------------------------------
// Module daq::allocator
// Packs measurement bindings into DAQ lists, ODTs and ODT entries and configures them on the target

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::CommandSender;
use crate::codec::{Command, IdentificationField};
use crate::config::{DaqConfigType, SessionConfig, StaticDaqList};
use crate::daq::{BindingId, DaqEntry, DaqList, Direction, MeasurementBinding};
use crate::error::{AllocationError, XcpError};
use crate::protocol::*;

// Limits of the one byte ODT and ODT entry numbers
const MAX_ODT_DYNAMIC: usize = 0xFF;
const MAX_ODT_ENTRIES_DYNAMIC: usize = 0xFF;

/// List parameters chosen by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationOptions {
    /// Request timestamps if the target supports them
    pub timestamps: bool,
    pub prescaler: u8,
    pub priority: u8,
}

impl Default for AllocationOptions {
    fn default() -> Self {
        AllocationOptions {
            timestamps: true,
            prescaler: 1,
            priority: 0,
        }
    }
}

//----------------------------------------------------------------------------------------------
// Layout

// Bindings of one DAQ list, in request order
struct Group {
    event: u16,
    direction: Direction,
    bindings: Vec<usize>,
}

fn group_bindings(bindings: &[MeasurementBinding]) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for (i, b) in bindings.iter().enumerate() {
        match groups.iter_mut().find(|g| g.event == b.event && g.direction == b.direction) {
            Some(g) => g.bindings.push(i),
            None => groups.push(Group {
                event: b.event,
                direction: b.direction,
                bindings: vec![i],
            }),
        }
    }
    groups
}

// Capacity limits of one list
#[derive(Debug, Clone, Copy)]
struct ListLimits {
    max_odt: usize,
    max_odt_entries: usize,
}

/// Compute the DAQ list layout for `bindings`
/// Pure function of its inputs, the same bindings and configuration always give the same layout
pub fn allocate(bindings: &[MeasurementBinding], config: &SessionConfig, options: &AllocationOptions) -> Result<Vec<DaqList>, AllocationError> {
    if bindings.is_empty() {
        return Err(AllocationError::NoBindings);
    }
    let daq = &config.daq;
    if !config.resources.contains(Resource::DAQ) {
        return Err(AllocationError::Unsupported("DAQ"));
    }

    let id_size = daq.identification.size();
    let ts_size = daq.timestamp.map_or(0, |t| t.size as usize);
    let max_dto = config.max_dto as usize;
    if max_dto <= id_size + ts_size {
        return Err(AllocationError::Unsupported("MAX_DTO too small for DAQ"));
    }

    // Check each binding on its own
    for (i, b) in bindings.iter().enumerate() {
        check_binding(i, b, config, options)?;
    }

    // One list per event and direction, in order of first appearance
    let groups = group_bindings(bindings);

    // Event channel capacity
    for g in &groups {
        if let Some(e) = daq.event(g.event) {
            let required = groups.iter().filter(|x| x.event == g.event).count();
            if !e.supports_lists(required) {
                return Err(AllocationError::EventCapacityExceeded {
                    event: g.event,
                    required,
                    max: e.max_daq_list as usize,
                });
            }
        }
    }

    // Assign list numbers
    let assigned: Vec<(u16, ListLimits)> = match daq.config_type {
        DaqConfigType::Dynamic => {
            let available = (daq.max_daq as usize).saturating_sub(daq.min_daq as usize);
            if groups.len() > available {
                return Err(AllocationError::TooManyLists {
                    required: groups.len(),
                    max: available,
                });
            }
            let limits = ListLimits {
                max_odt: MAX_ODT_DYNAMIC,
                max_odt_entries: MAX_ODT_ENTRIES_DYNAMIC,
            };
            (0..groups.len()).map(|i| (daq.min_daq as u16 + i as u16, limits)).collect()
        }
        DaqConfigType::Static => assign_static(&groups, &daq.static_lists)?,
    };

    if daq.identification == IdentificationField::RelativeByte {
        if let Some((number, _)) = assigned.iter().find(|(n, _)| *n > 0xFF) {
            return Err(AllocationError::TooManyLists {
                required: *number as usize + 1,
                max: 0x100,
            });
        }
    }

    // Pack
    let mut lists = Vec::with_capacity(groups.len());
    let mut total_odts: usize = 0;
    for (g, (number, limits)) in groups.iter().zip(assigned) {
        let timestamp = g.direction == Direction::Acquire && daq.timestamp.is_some_and(|t| t.fixed || options.timestamps);
        let first_odt_capacity = max_dto - id_size - if timestamp { ts_size } else { 0 };
        let odt_capacity = max_dto - id_size;

        let mut entries: Vec<DaqEntry> = Vec::with_capacity(g.bindings.len());
        let mut odt_sizes: Vec<usize> = vec![0];
        let mut odt_entries: usize = 0;
        for &i in &g.bindings {
            let b = &bindings[i];
            let odt = odt_sizes.len() - 1;
            let capacity = if odt == 0 { first_odt_capacity } else { odt_capacity };
            if odt_sizes[odt] + b.size > capacity || odt_entries >= limits.max_odt_entries {
                odt_sizes.push(0);
                odt_entries = 0;
            }
            let odt = odt_sizes.len() - 1;
            entries.push(DaqEntry {
                address: b.address,
                ext: b.ext,
                size: b.size,
                odt: odt.min(0xFF) as u8,
                entry: odt_entries.min(0xFF) as u8,
                offset: odt_sizes[odt],
                binding: BindingId(i),
            });
            odt_sizes[odt] += b.size;
            odt_entries += 1;
        }

        if odt_sizes.len() > limits.max_odt {
            return Err(AllocationError::TooManyOdts {
                daq: number,
                required: odt_sizes.len(),
                max: limits.max_odt,
            });
        }
        total_odts += odt_sizes.len();
        if daq.identification == IdentificationField::Absolute && total_odts > XCP_MAX_PID {
            return Err(AllocationError::TooManyOdts {
                daq: number,
                required: total_odts,
                max: XCP_MAX_PID,
            });
        }

        lists.push(DaqList {
            number,
            event: g.event,
            direction: g.direction,
            enabled: true,
            resume: false,
            timestamp,
            prescaler: if daq.prescaler_supported { options.prescaler.max(1) } else { 1 },
            priority: options.priority,
            entries,
            odt_sizes,
        });
    }

    for l in &lists {
        debug!(
            "DAQ list {}: event={} {:?} odts={} entries={} timestamp={}",
            l.number,
            l.event,
            l.direction,
            l.odt_count(),
            l.entries.len(),
            l.timestamp
        );
    }
    Ok(lists)
}

fn check_binding(index: usize, b: &MeasurementBinding, config: &SessionConfig, options: &AllocationOptions) -> Result<(), AllocationError> {
    let daq = &config.daq;
    trace!("check binding {}: 0x{:08X} size={} event={} {:?}", index, b.address, b.size, b.event, b.direction);

    if b.direction == Direction::Stimulate && !config.resources.contains(Resource::STIM) {
        return Err(AllocationError::Unsupported("STIM"));
    }

    // Unknown events can only be detected when the target lists them
    if !daq.events.is_empty() {
        match daq.event(b.event) {
            None => return Err(AllocationError::UnknownEvent(b.event)),
            Some(e) if b.direction == Direction::Acquire && !e.daq => return Err(AllocationError::Unsupported("event channel without DAQ")),
            Some(e) if b.direction == Direction::Stimulate && !e.stim => return Err(AllocationError::Unsupported("event channel without STIM")),
            Some(_) => {}
        }
    } else if daq.max_event != 0 && b.event >= daq.max_event {
        return Err(AllocationError::UnknownEvent(b.event));
    }

    let granularity = (config.granularity.size()).max(daq.granularity_odt_entry);
    let misaligned = b.size == 0 || b.address % config.granularity.size() as u32 != 0 || b.size % granularity.max(1) as usize != 0;
    if misaligned {
        return Err(AllocationError::Misaligned {
            address: b.address,
            size: b.size,
            granularity,
        });
    }

    // A binding must fit into the first ODT of its list, bindings are never split
    let timestamp = b.direction == Direction::Acquire && daq.timestamp.is_some_and(|t| t.fixed || options.timestamps);
    let ts_size = if timestamp { daq.timestamp.map_or(0, |t| t.size as usize) } else { 0 };
    let frame_capacity = config.max_dto as usize - daq.identification.size() - ts_size;
    let entry_size = match b.direction {
        Direction::Acquire => daq.max_odt_entry_size,
        Direction::Stimulate => daq.max_odt_entry_size_stim,
    };
    let max = if entry_size == 0 { frame_capacity } else { frame_capacity.min(entry_size) };
    if b.size > max {
        return Err(AllocationError::BindingTooLarge {
            address: b.address,
            size: b.size,
            max,
        });
    }
    Ok(())
}

// Static mode, choose the first free predefined list able to take the group
fn assign_static(groups: &[Group], lists: &[StaticDaqList]) -> Result<Vec<(u16, ListLimits)>, AllocationError> {
    let mut used = vec![false; lists.len()];
    let mut assigned = Vec::with_capacity(groups.len());
    for g in groups {
        let found = lists.iter().enumerate().position(|(i, l)| {
            !used[i]
                && l.fixed_event.map_or(true, |e| e == g.event)
                && match g.direction {
                    Direction::Acquire => l.daq_supported,
                    Direction::Stimulate => l.stim_supported,
                }
                && l.max_odt_entries as usize * l.max_odt as usize >= g.bindings.len()
        });
        match found {
            Some(i) => {
                used[i] = true;
                let l = &lists[i];
                assigned.push((
                    l.daq,
                    ListLimits {
                        max_odt: l.max_odt as usize,
                        max_odt_entries: (l.max_odt_entries as usize).max(1),
                    },
                ));
            }
            None => {
                return Err(AllocationError::TooManyLists {
                    required: groups.len(),
                    max: lists.len(),
                })
            }
        }
    }
    Ok(assigned)
}

//----------------------------------------------------------------------------------------------
// Configuration commands

// Failed commands abort the allocation
fn command_failed(e: XcpError) -> XcpError {
    match e {
        XcpError::Transaction(e) => XcpError::Allocation(AllocationError::Command(e)),
        XcpError::Codec(e) => XcpError::Allocation(AllocationError::Codec(e)),
        e => e,
    }
}

async fn command<C: CommandSender + ?Sized>(sender: &C, cmd: Command) -> Result<(), XcpError> {
    trace!("DAQ configuration: {:?}", cmd);
    sender.command(&cmd).await.map(|_| ()).map_err(command_failed)
}

/// Write the list layout to the target
/// Commands are issued in protocol phase order, the first failure aborts
pub(crate) async fn configure<C: CommandSender + ?Sized>(sender: &C, lists: &[DaqList], config_type: DaqConfigType) -> Result<(), XcpError> {
    match config_type {
        DaqConfigType::Dynamic => {
            command(sender, Command::FreeDaq).await?;
            command(sender, Command::AllocDaq { count: lists.len() as u16 }).await?;
            for l in lists {
                command(
                    sender,
                    Command::AllocOdt {
                        daq: l.number,
                        count: l.odt_count() as u8,
                    },
                )
                .await?;
            }
            for l in lists {
                for odt in 0..l.odt_count() as u8 {
                    command(
                        sender,
                        Command::AllocOdtEntry {
                            daq: l.number,
                            odt,
                            count: l.entries_of(odt).count() as u8,
                        },
                    )
                    .await?;
                }
            }
        }
        DaqConfigType::Static => {
            for l in lists {
                command(sender, Command::ClearDaqList { daq: l.number }).await?;
            }
        }
    }

    // ODT entries, the entry pointer auto increments after WRITE_DAQ
    for l in lists {
        for odt in 0..l.odt_count() as u8 {
            command(sender, Command::SetDaqPtr { daq: l.number, odt, entry: 0 }).await?;
            for e in l.entries_of(odt) {
                command(
                    sender,
                    Command::WriteDaq {
                        bit_offset: 0xFF,
                        size: e.size,
                        ext: e.ext,
                        addr: e.address,
                    },
                )
                .await?;
            }
        }
    }

    for l in lists {
        command(
            sender,
            Command::SetDaqListMode {
                mode: l.mode(),
                daq: l.number,
                event: l.event,
                prescaler: l.prescaler,
                priority: l.priority,
            },
        )
        .await?;
    }

    info!("DAQ configured: {} lists, {} entries", lists.len(), lists.iter().map(|l| l.entries.len()).sum::<usize>());
    Ok(())
}

//----------------------------------------------------------------------------------------------

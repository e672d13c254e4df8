//! Persistent bond storage.
//!
//! Uses the nRF52840's internal flash via the `sequential-storage` crate.
//! Two kinds of item live in one key-value map:
//!
//!   - key `slot`        : the slot's [`BondRecord`] (address, name, last seen)
//!   - key `0x40 + n`    : entry `n` of the SoftDevice link-key table
//!
//! Flash pages are managed by `sequential-storage`, which handles wear
//! levelling and garbage collection.  Writes never happen inline: the
//! registry queues [`PersistOp`]s and [`storage_task`] applies them.

use defmt::{debug, error, info, warn};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Timer;
use embedded_storage_async::nor_flash::NorFlash;
use sequential_storage::cache::NoCache;
use sequential_storage::map;

use mouthpad_usb::bonds::{
    BondRecord, BondRegistry, LinkKeys, PersistOp, BOND_RECORD_MAX_SIZE, KEY_TABLE_SLOTS, LINK_KEYS_SIZE,
};
use mouthpad_usb::config::{MAX_PAIRED_DEVICES, STORAGE_FLASH_PAGE_COUNT, STORAGE_FLASH_PAGE_START};
use mouthpad_usb::error::{Error, RegistryError};

use crate::link::bonder::bonder;
use crate::link::with_shared;

/// Flash page size for nRF52840 (4 KB).
const FLASH_PAGE_SIZE: u32 = 4096;

/// Start address of our storage region.
const STORAGE_START: u32 = STORAGE_FLASH_PAGE_START * FLASH_PAGE_SIZE;

/// End address (exclusive) of our storage region.
const STORAGE_END: u32 = (STORAGE_FLASH_PAGE_START + STORAGE_FLASH_PAGE_COUNT) * FLASH_PAGE_SIZE;

/// Link-key items sit above the record keys.
const KEYS_BASE: u8 = 0x40;

/// Scratch buffer for one item, plus room for the map's own header.
const ITEM_BUF_SIZE: usize = 128;

/// Coalesce bursts of bond changes into one flash pass.
const FLUSH_DEBOUNCE_MS: u64 = 500;

const _: () = assert!(BOND_RECORD_MAX_SIZE + 16 <= ITEM_BUF_SIZE);
const _: () = assert!(LINK_KEYS_SIZE + 16 <= ITEM_BUF_SIZE);

static FLUSH: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Wake the storage task.  Safe to call from any context.
pub fn request_flush() {
    FLUSH.signal(());
}

fn record_key(slot: usize) -> u8 {
    slot as u8
}

fn keys_key(slot: usize) -> u8 {
    KEYS_BASE + slot as u8
}

/// Read every stored record into `registry` and the stored link keys into
/// the bonder.
pub async fn load<F: NorFlash>(flash: &mut F, registry: &mut BondRegistry) {
    let mut buf = [0u8; ITEM_BUF_SIZE];
    let mut records = 0;
    let mut keys = 0;

    for slot in 0..MAX_PAIRED_DEVICES {
        match map::fetch_item::<u8, &[u8], _>(
            flash,
            STORAGE_START..STORAGE_END,
            &mut NoCache::new(),
            &mut buf,
            &record_key(slot),
        )
        .await
        {
            Ok(Some(data)) => match BondRecord::deserialize(data)
                .ok_or(RegistryError::Corrupt)
                .and_then(|record| registry.restore(slot, record))
            {
                Ok(()) => records += 1,
                Err(e) => warn!("bond record in slot {} unusable: {}", slot, e),
            },
            Ok(None) => {}
            Err(e) => error!("Flash read error: {:?}", defmt::Debug2Format(&e)),
        }
    }

    for slot in 0..KEY_TABLE_SLOTS {
        match map::fetch_item::<u8, &[u8], _>(
            flash,
            STORAGE_START..STORAGE_END,
            &mut NoCache::new(),
            &mut buf,
            &keys_key(slot),
        )
        .await
        {
            Ok(Some(data)) => match LinkKeys::deserialize(data) {
                Some(k) => {
                    bonder().restore(&k);
                    keys += 1;
                }
                None => warn!("link keys in slot {} unusable", slot),
            },
            Ok(None) => {}
            Err(e) => error!("Flash read error: {:?}", defmt::Debug2Format(&e)),
        }
    }

    // loading is not a change
    let _ = registry.take_pending();
    let _ = bonder().take_dirty();
    info!("Loaded {} bond record(s), {} key set(s) from flash", records, keys);
}

async fn store<F: NorFlash>(flash: &mut F, key: u8, item: &[u8]) -> Result<(), Error> {
    let mut buf = [0u8; ITEM_BUF_SIZE];
    map::store_item::<u8, &[u8], _>(
        flash,
        STORAGE_START..STORAGE_END,
        &mut NoCache::new(),
        &mut buf,
        &key,
        &item,
    )
    .await
    .map_err(|e| {
        error!("Flash write error: {:?}", defmt::Debug2Format(&e));
        Error::Storage
    })
}

async fn remove<F: NorFlash>(flash: &mut F, key: u8) -> Result<(), Error> {
    let mut buf = [0u8; ITEM_BUF_SIZE];
    map::remove_item::<u8, _>(
        flash,
        STORAGE_START..STORAGE_END,
        &mut NoCache::new(),
        &mut buf,
        &key,
    )
    .await
    .map_err(|e| {
        error!("Flash remove error: {:?}", defmt::Debug2Format(&e));
        Error::Storage
    })
}

/// Apply one queued registry change.
pub async fn apply<F: NorFlash>(flash: &mut F, op: PersistOp) -> Result<(), Error> {
    match op {
        PersistOp::EraseAll => {
            sequential_storage::erase_all(flash, STORAGE_START..STORAGE_END)
                .await
                .map_err(|e| {
                    error!("Flash erase error: {:?}", defmt::Debug2Format(&e));
                    Error::Storage
                })?;
            info!("All bonds erased from flash");
        }
        PersistOp::Store { slot, record } => {
            let mut data = [0u8; BOND_RECORD_MAX_SIZE];
            let len = record.serialize(&mut data);
            store(flash, record_key(slot), &data[..len]).await?;
            debug!("bond record stored in slot {}", slot);
        }
        PersistOp::Erase { slot } => {
            remove(flash, record_key(slot)).await?;
            debug!("bond slot {} erased", slot);
        }
    }
    Ok(())
}

/// Mirror the bonder's key table, one item per table position.
async fn save_keys<F: NorFlash>(flash: &mut F) -> Result<(), Error> {
    for (n, keys) in bonder().snapshot().iter().enumerate() {
        match keys {
            Some(keys) => {
                let mut data = [0u8; LINK_KEYS_SIZE];
                let len = keys.serialize(&mut data);
                store(flash, keys_key(n), &data[..len]).await?;
            }
            None => remove(flash, keys_key(n)).await?,
        }
    }
    debug!("link keys saved");
    Ok(())
}

/// Owns the flash and applies bond changes as they are requested.
#[embassy_executor::task]
pub async fn storage_task(mut flash: nrf_softdevice::Flash) -> ! {
    loop {
        FLUSH.wait().await;
        Timer::after_millis(FLUSH_DEBOUNCE_MS).await;
        FLUSH.reset();

        let Some(ops) = with_shared(|s| s.manager.bonds_mut().take_pending()) else {
            continue;
        };
        for op in ops {
            if let Err(e) = apply(&mut flash, op).await {
                warn!("bond change not persisted: {}", e);
            }
        }

        if bonder().take_dirty() {
            if let Err(e) = save_keys(&mut flash).await {
                warn!("link keys not persisted: {}", e);
            }
        }
    }
}

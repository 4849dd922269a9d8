// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Poison-free wrappers around `std::sync::{Mutex, RwLock}`.
//!
//! A panic while holding one of `std`'s locks poisons it, turning every
//! future `lock()`/`read()`/`write()` call into an error the caller has to
//! handle even though nothing here ever wants to recover from a poisoned
//! lock: a panicking device-model thread already means the VM is being torn
//! down. These wrappers unwrap the poison instead of propagating it, which
//! is what every call site in this workspace wants.

use std::ops::{Deref, DerefMut};
use std::sync::{self, LockResult, TryLockResult};

pub struct Mutex<T: ?Sized>(sync::Mutex<T>);

pub struct MutexGuard<'a, T: ?Sized>(sync::MutexGuard<'a, T>);

impl<T> Mutex<T> {
    pub fn new(val: T) -> Self {
        Mutex(sync::Mutex::new(val))
    }

    pub fn into_inner(self) -> T {
        self.0.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        MutexGuard(clear_poison(self.0.lock()))
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.0.try_lock() {
            Ok(g) => Some(MutexGuard(g)),
            Err(sync::TryLockError::Poisoned(e)) => Some(MutexGuard(e.into_inner())),
            Err(sync::TryLockError::WouldBlock) => None,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

pub struct RwLock<T: ?Sized>(sync::RwLock<T>);

pub struct RwLockReadGuard<'a, T: ?Sized>(sync::RwLockReadGuard<'a, T>);
pub struct RwLockWriteGuard<'a, T: ?Sized>(sync::RwLockWriteGuard<'a, T>);

impl<T> RwLock<T> {
    pub fn new(val: T) -> Self {
        RwLock(sync::RwLock::new(val))
    }

    pub fn into_inner(self) -> T {
        self.0.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        RwLockReadGuard(clear_poison(self.0.read()))
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        RwLockWriteGuard(clear_poison(self.0.write()))
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        try_clear_poison(self.0.try_read()).map(RwLockReadGuard)
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        try_clear_poison(self.0.try_write()).map(RwLockWriteGuard)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

fn clear_poison<Guard>(r: LockResult<Guard>) -> Guard {
    r.unwrap_or_else(|e| e.into_inner())
}

fn try_clear_poison<Guard>(r: TryLockResult<Guard>) -> Option<Guard> {
    match r {
        Ok(g) => Some(g),
        Err(sync::TryLockError::Poisoned(e)) => Some(e.into_inner()),
        Err(sync::TryLockError::WouldBlock) => None,
    }
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}
